use std::sync::Arc;

use {
    secrecy::{ExposeSecret, Secret},
    subtle::ConstantTimeEq,
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use botlink_store::{RecordStore, StoreError};

use crate::{
    identity::{BotIdentity, BotRecord, now_ms, validate_name},
    secret::generate_secret,
};

/// Record keys are namespaced so the store can be shared with other data.
const KEY_PREFIX: &str = "bot/";

/// Compared against when the presented name is unknown, so lookups of
/// unknown and known names cost the same.
const DUMMY_SECRET: &[u8] = b"botlink-unknown-identity-placeholder-secret";

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("bot '{0}' is already registered")]
    DuplicateIdentity(String),
    #[error("bot '{0}' not found")]
    NotFound(String),
    #[error("invalid bot name '{0}': use 1-64 characters from [A-Za-z0-9._-]")]
    InvalidName(String),
    #[error("secret must not be empty")]
    EmptySecret,
    #[error("stored record for '{name}' is corrupt: {source}")]
    Corrupt {
        name: String,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// CRUD and verification over bot identities, backed by a [`RecordStore`].
pub struct BotRepository {
    store: Arc<dyn RecordStore>,
    /// Serializes every mutation so read-modify-write sequences (register,
    /// describe) never interleave with a delete.
    write_lock: Mutex<()>,
}

fn key(name: &str) -> String {
    format!("{KEY_PREFIX}{name}")
}

fn decode(name: &str, value: serde_json::Value) -> Result<BotIdentity, RepositoryError> {
    serde_json::from_value::<BotRecord>(value)
        .map(BotIdentity::from)
        .map_err(|source| RepositoryError::Corrupt {
            name: name.to_string(),
            source,
        })
}

fn encode(identity: &BotIdentity) -> Result<serde_json::Value, RepositoryError> {
    serde_json::to_value(BotRecord::from(identity)).map_err(|source| RepositoryError::Corrupt {
        name: identity.name.clone(),
        source,
    })
}

impl BotRepository {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Register a new identity. When `secret` is `None` a random one is
    /// generated; either way the returned identity carries it so the caller
    /// can hand it to the operator exactly once.
    pub async fn register(
        &self,
        name: &str,
        secret: Option<String>,
        description: Option<String>,
    ) -> Result<BotIdentity, RepositoryError> {
        validate_name(name)?;
        let secret = match secret {
            Some(s) if s.is_empty() => return Err(RepositoryError::EmptySecret),
            Some(s) => s,
            None => generate_secret(),
        };

        let _guard = self.write_lock.lock().await;
        if self.store.get(&key(name)).await?.is_some() {
            return Err(RepositoryError::DuplicateIdentity(name.to_string()));
        }

        let now = now_ms();
        let identity = BotIdentity {
            name: name.to_string(),
            secret: Secret::new(secret),
            description,
            created_at: now,
            updated_at: now,
        };
        self.store.put(&key(name), encode(&identity)?).await?;
        info!(bot = name, "registered bot identity");
        Ok(identity)
    }

    pub async fn find(&self, name: &str) -> Result<BotIdentity, RepositoryError> {
        let value = self
            .store
            .get(&key(name))
            .await?
            .ok_or_else(|| RepositoryError::NotFound(name.to_string()))?;
        decode(name, value)
    }

    /// Check a presented secret in constant time. Any lookup failure counts
    /// as a mismatch.
    pub async fn verify(&self, name: &str, presented: &str) -> bool {
        let identity = match self.find(name).await {
            Ok(identity) => Some(identity),
            Err(RepositoryError::NotFound(_)) => None,
            Err(e) => {
                warn!(bot = name, error = %e, "identity lookup failed during verification");
                None
            },
        };

        let presented = presented.as_bytes();
        match identity {
            Some(identity) => {
                bool::from(identity.secret.expose_secret().as_bytes().ct_eq(presented))
            },
            None => {
                let _ = DUMMY_SECRET.ct_eq(presented);
                debug!(bot = name, "verification against unknown identity");
                false
            },
        }
    }

    pub async fn remove(&self, name: &str) -> Result<(), RepositoryError> {
        let _guard = self.write_lock.lock().await;
        if self.store.delete(&key(name)).await? {
            info!(bot = name, "removed bot identity");
            Ok(())
        } else {
            Err(RepositoryError::NotFound(name.to_string()))
        }
    }

    /// Refresh the free-form metadata of an identity.
    pub async fn describe(
        &self,
        name: &str,
        description: Option<String>,
    ) -> Result<BotIdentity, RepositoryError> {
        let _guard = self.write_lock.lock().await;
        let mut identity = self.find(name).await?;
        identity.description = description;
        identity.updated_at = now_ms();
        self.store.put(&key(name), encode(&identity)?).await?;
        Ok(identity)
    }

    /// All identities, ordered by name.
    pub async fn list(&self) -> Result<Vec<BotIdentity>, RepositoryError> {
        let mut out = Vec::new();
        for (k, value) in self.store.list().await? {
            let Some(name) = k.strip_prefix(KEY_PREFIX) else {
                continue;
            };
            out.push(decode(name, value)?);
        }
        Ok(out)
    }
}
