//! Keyed record storage.
//!
//! Records are opaque JSON values addressed by a string key. Callers above
//! this crate (the bot repository) own the record layout.

pub mod file;
pub mod memory;

use std::sync::Arc;

use {async_trait::async_trait, serde_json::Value, tracing::info};

use botlink_config::StorageConfig;

pub use {file::FileRecordStore, memory::MemoryRecordStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("record store contents are not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage contract required by the bot repository.
///
/// Every mutating call is durable (for durable backends) before it returns,
/// and no caller ever observes a half-applied write.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn put(&self, key: &str, record: Value) -> Result<()>;
    /// Returns whether a record existed.
    async fn delete(&self, key: &str) -> Result<bool>;
    /// All records, ordered by key.
    async fn list(&self) -> Result<Vec<(String, Value)>>;

    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;
}

/// Open the backend selected by `config`.
pub async fn open_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn RecordStore>> {
    match config.file_path() {
        Some(path) => {
            let store = FileRecordStore::open(path.clone()).await?;
            info!(path = %path.display(), "using file record store");
            Ok(Arc::new(store))
        },
        None => {
            info!("using in-memory record store");
            Ok(Arc::new(MemoryRecordStore::new()))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_store_honours_backend_selector() {
        let store = open_store(&StorageConfig::Memory).await.unwrap();
        assert_eq!(store.backend(), "memory");

        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&StorageConfig::File {
            path: Some(dir.path().join("bots.json")),
        })
        .await
        .unwrap();
        assert_eq!(store.backend(), "file");
    }
}
