use std::collections::BTreeMap;

use {async_trait::async_trait, serde_json::Value, tokio::sync::RwLock};

use crate::{RecordStore, Result};

/// Process-local store; contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<String, Value>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, record: Value) -> Result<()> {
        self.records.write().await.insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn list(&self) -> Result<Vec<(String, Value)>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
