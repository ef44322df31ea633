//! Config schema types (server, relay timing, storage backend).

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use botlink_protocol::{
    DEFAULT_BOT_KEEP_DURATION_MS, DEFAULT_BOT_RESPONSE_TIMEOUT_MS, DEFAULT_HANDSHAKE_TIMEOUT_MS,
    DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_SWEEP_INTERVAL_MS,
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotlinkConfig {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub storage: StorageConfig,
}

/// HTTP listener and route layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Prefix of the inbound chat endpoint; the bot name is appended.
    pub chat_path: String,
    /// WebSocket upgrade endpoint for bot workers.
    pub worker_path: String,
    /// Bearer token for the admin API. When unset the admin API only answers
    /// loopback clients.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 18790,
            chat_path: "/api/messages".into(),
            worker_path: "/ws".into(),
            admin_token: None,
        }
    }
}

/// Timing knobs of the relay core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Per-dispatch wait for a worker reply.
    pub bot_response_timeout_ms: u64,
    /// How long finished request records stay around for diagnostics.
    pub bot_keep_duration_ms: u64,
    /// A worker silent for longer than this is evicted.
    pub idle_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bot_response_timeout_ms: DEFAULT_BOT_RESPONSE_TIMEOUT_MS,
            bot_keep_duration_ms: DEFAULT_BOT_KEEP_DURATION_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
        }
    }
}

impl RelayConfig {
    pub fn bot_response_timeout(&self) -> Duration {
        Duration::from_millis(self.bot_response_timeout_ms)
    }

    pub fn bot_keep_duration(&self) -> Duration {
        Duration::from_millis(self.bot_keep_duration_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Sweep cadence, never zero (a zero interval would panic the timer).
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Where bot identities are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// JSON file on disk. `path` defaults to `~/.botlink/bots.json`.
    File {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
    /// Process memory only; identities vanish on restart.
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::File { path: None }
    }
}

impl StorageConfig {
    /// Resolved file path for the file backend.
    pub fn file_path(&self) -> Option<PathBuf> {
        match self {
            Self::File { path } => Some(
                path.clone()
                    .unwrap_or_else(|| crate::loader::data_dir().join("bots.json")),
            ),
            Self::Memory => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg: BotlinkConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.server.port, 18790);
        assert_eq!(cfg.server.chat_path, "/api/messages");
        assert_eq!(cfg.relay.bot_response_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.storage, StorageConfig::File { path: None });
    }

    #[test]
    fn parses_memory_backend_and_relay_overrides() {
        let cfg: BotlinkConfig = toml::from_str(
            r#"
            [relay]
            bot_response_timeout_ms = 5000
            bot_keep_duration_ms = 1000

            [storage]
            backend = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.relay.bot_response_timeout_ms, 5000);
        assert_eq!(cfg.relay.bot_keep_duration(), Duration::from_secs(1));
        assert_eq!(cfg.relay.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS);
        assert_eq!(cfg.storage, StorageConfig::Memory);
        assert!(cfg.storage.file_path().is_none());
    }

    #[test]
    fn parses_file_backend_with_path() {
        let cfg: BotlinkConfig = serde_json::from_str(
            r#"{"storage": {"backend": "file", "path": "/var/lib/botlink/bots.json"}}"#,
        )
        .unwrap();
        assert_eq!(
            cfg.storage.file_path(),
            Some(PathBuf::from("/var/lib/botlink/bots.json"))
        );
    }

    #[test]
    fn zero_sweep_interval_is_clamped() {
        let relay = RelayConfig {
            sweep_interval_ms: 0,
            ..RelayConfig::default()
        };
        assert_eq!(relay.sweep_interval(), Duration::from_millis(1));
    }
}
