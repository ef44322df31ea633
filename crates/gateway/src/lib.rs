//! Gateway: bot worker connections, request/reply relay, and the HTTP surface.
//!
//! Lifecycle:
//! 1. Open the record store, build the bot repository
//! 2. Build the relay (connection registry + pending request table)
//! 3. Start HTTP server (health, chat endpoint, admin API, metrics)
//! 4. Attach the worker WebSocket upgrade handler
//! 5. Run the maintenance timer (idle sweep, record purge)
//!
//! The relay core in [`relay`] and [`connections`] only sees workers through
//! the [`channel::DuplexChannel`] capability; [`ws`] is the production
//! transport.

pub mod admin;
pub mod auth;
pub mod channel;
pub mod chat;
pub mod connections;
pub mod error;
pub mod relay;
pub mod server;
pub mod ws;

pub use {
    channel::{CloseReason, DuplexChannel, InboundEvent, InboundStream, LocalChannel, LocalPeer},
    connections::{Connection, ConnectionRegistry},
    error::{ApiError, RelayError},
    relay::{RelayService, RelaySettings, RequestOutcome, RequestRecord},
    server::{AppState, build_gateway_app, serve, spawn_maintenance, start_gateway},
};
