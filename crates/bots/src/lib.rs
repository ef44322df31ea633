//! Catalogue of registered bot identities.
//!
//! A bot worker may only attach to the gateway under a name registered here,
//! presenting the secret issued at registration.

pub mod identity;
pub mod repository;
pub mod secret;

pub use {
    identity::{BotIdentity, validate_name},
    repository::{BotRepository, RepositoryError},
    secret::generate_secret,
};
