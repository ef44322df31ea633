//! Configuration for the botlink gateway: schema, discovery and loading.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        config_dir, data_dir, discover_and_load, load_config, render_config, write_default_config,
    },
    schema::{BotlinkConfig, RelayConfig, ServerConfig, StorageConfig},
};
