use std::{collections::BTreeMap, path::PathBuf};

use {
    async_trait::async_trait,
    serde_json::Value,
    tokio::sync::RwLock,
    tracing::{debug, warn},
};

use crate::{RecordStore, Result};

/// JSON file-backed store: a single object mapping key → record.
///
/// The whole file is rewritten on every mutation through a temp file and a
/// rename, so a crash mid-write leaves the previous contents intact. The
/// write lock is held across the disk write; readers never see a record that
/// has not been persisted.
#[derive(Debug)]
pub struct FileRecordStore {
    path: PathBuf,
    records: RwLock<BTreeMap<String, Value>>,
}

impl FileRecordStore {
    /// Open the store at `path`, loading existing records if the file exists.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(data) if data.trim().is_empty() => BTreeMap::new(),
            Ok(data) => serde_json::from_str(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), count = records.len(), "loaded record store");
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn persist(&self, records: &BTreeMap<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;

        // Identity secrets live in here.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, record: Value) -> Result<()> {
        let mut records = self.records.write().await;
        let previous = records.insert(key.to_string(), record);
        if let Err(e) = self.persist(&records).await {
            warn!(key, error = %e, "failed to persist record, rolling back");
            match previous {
                Some(prev) => records.insert(key.to_string(), prev),
                None => records.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        let Some(previous) = records.remove(key) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&records).await {
            warn!(key, error = %e, "failed to persist delete, rolling back");
            records.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(true)
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
        "file"
    }
}
