//! Wire protocol spoken between the relay gateway and bot workers.
//!
//! A worker opens a WebSocket, sends a [`Handshake`] as its first text frame,
//! receives a [`HandshakeReply`], and from then on exchanges [`Frame`]s:
//!
//! ```json
//! {"type":"event","correlationId":"…","payload":{…}}   // gateway → worker
//! {"type":"reply","correlationId":"…","payload":{…}}   // worker → gateway
//! {"type":"ping"}                                       // either direction
//! ```

use std::fmt;

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted inbound text frame.
pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024;

// ── Defaults ─────────────────────────────────────────────────────────────────

pub const DEFAULT_BOT_RESPONSE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_BOT_KEEP_DURATION_MS: u64 = 300_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Upper bound for a caller-supplied dispatch timeout.
pub const MAX_DISPATCH_TIMEOUT_MS: u64 = 600_000;

// ── Errors ───────────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const NOT_CONNECTED: &str = "NOT_CONNECTED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const CONNECTION_LOST: &str = "CONNECTION_LOST";
    pub const DUPLICATE_IDENTITY: &str = "DUPLICATE_IDENTITY";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
}

/// Error payload used on both the worker socket and the HTTP surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

impl ErrorShape {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame of {size} bytes exceeds the {MAX_PAYLOAD_BYTES} byte limit")]
    TooLarge { size: usize },
}

fn check_size(raw: &str) -> Result<(), ProtocolError> {
    if raw.len() > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::TooLarge { size: raw.len() });
    }
    Ok(())
}

// ── Handshake ────────────────────────────────────────────────────────────────

/// First frame a worker sends after the socket opens.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub identity_name: String,
    pub secret: String,
}

impl Handshake {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        check_size(raw)?;
        Ok(serde_json::from_str(raw)?)
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("identity_name", &self.identity_name)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Gateway answer to a [`Handshake`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HandshakeReply {
    Hello {
        #[serde(rename = "botName")]
        bot_name: String,
        #[serde(rename = "channelId")]
        channel_id: String,
        protocol: u32,
    },
    Error {
        error: ErrorShape,
    },
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// A typed frame exchanged after the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Event {
        #[serde(rename = "correlationId")]
        correlation_id: String,
        #[serde(default)]
        payload: Value,
    },
    Reply {
        #[serde(rename = "correlationId")]
        correlation_id: String,
        #[serde(default)]
        payload: Value,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
    },
}

impl Frame {
    pub fn event(correlation_id: impl Into<String>, payload: Value) -> Self {
        Self::Event {
            correlation_id: correlation_id.into(),
            payload,
        }
    }

    pub fn reply(correlation_id: impl Into<String>, payload: Value) -> Self {
        Self::Reply {
            correlation_id: correlation_id.into(),
            payload,
        }
    }

    pub fn ping() -> Self {
        Self::Ping {
            payload: Value::Null,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        check_size(raw)?;
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Frame type as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Event { .. } => "event",
            Self::Reply { .. } => "reply",
            Self::Ping { .. } => "ping",
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::Event { correlation_id, .. } | Self::Reply { correlation_id, .. } => {
                Some(correlation_id)
            },
            Self::Ping { .. } => None,
        }
    }
}
