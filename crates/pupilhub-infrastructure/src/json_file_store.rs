//! File-backed [`KeyValueStore`].
//!
//! Each key maps to one `<key>.json` file in the storage directory. Writes
//! use tmp file + rename, and a per-key async lock keeps at most one physical
//! write in flight for any key.

use crate::paths::HubPaths;
use crate::storage::AtomicJsonFile;
use async_trait::async_trait;
use pupilhub_core::{HubError, KeyValueStore, Result, StoredBlob};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct JsonFileStore {
    dir: PathBuf,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JsonFileStore {
    /// Creates a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a store in the platform data directory.
    pub fn with_default_path() -> Result<Self> {
        Ok(Self::new(HubPaths::storage_dir()?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, key: &str) -> Result<AtomicJsonFile<StoredBlob>> {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if name.trim_matches('.').is_empty() {
            return Err(HubError::config(format!("Invalid storage key '{key}'")));
        }
        Ok(AtomicJsonFile::new(self.dir.join(format!("{name}.json"))))
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks.entry(key.to_string()).or_default().clone()
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn load(&self, key: &str) -> Result<Option<StoredBlob>> {
        let file = self.file_for(key)?;
        let lock = self.lock_for(key).await;
        let _guard = lock.lock().await;

        tokio::task::spawn_blocking(move || file.load())
            .await
            .map_err(|e| HubError::internal(format!("Failed to spawn blocking task: {e}")))?
            .map_err(HubError::from)
    }

    async fn save(&self, key: &str, blob: &StoredBlob) -> Result<()> {
        let file = self.file_for(key)?;
        let lock = self.lock_for(key).await;
        let _guard = lock.lock().await;

        let blob = blob.clone();
        let path = file.path().display().to_string();
        tokio::task::spawn_blocking(move || file.save(&blob))
            .await
            .map_err(|e| HubError::internal(format!("Failed to spawn blocking task: {e}")))?
            .map_err(|e| HubError::store_write(format!("{path}: {e}")))?;

        tracing::debug!(key, "Persisted store blob");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn blob(value: serde_json::Value) -> StoredBlob {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_load_missing_key() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("storage"));
        assert!(store.load("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("storage"));
        let data = blob(json!({"pupil_ids": ["1", "2"], "pupil_data": {"1": {"schedule": []}}}));

        store.save("family", &data).await.unwrap();

        assert_eq!(store.load("family").await.unwrap(), Some(data));
        assert!(temp_dir.path().join("storage/family.json").exists());
    }

    #[tokio::test]
    async fn test_keys_are_sanitized() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path().to_path_buf());
        store.save("entry/../x", &blob(json!({"a": 1}))).await.unwrap();

        assert!(temp_dir.path().join("entry_.._x.json").exists());
        assert!(store.save("..", &StoredBlob::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_unwritable_directory_is_store_write_error() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not_a_dir");
        std::fs::write(&blocker, "x").unwrap();
        let store = JsonFileStore::new(blocker);

        let err = store.save("k", &StoredBlob::new()).await.unwrap_err();
        assert!(matches!(err, HubError::StoreWrite(_)));
    }
}
