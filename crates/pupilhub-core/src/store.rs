//! Durable key/value boundary.

use crate::error::Result;
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};

/// The mapping persisted under one key.
pub type StoredBlob = Map<String, JsonValue>;

/// A durable key/value store.
///
/// `save` must be atomic at the granularity of one call: a subsequent `load`
/// observes either the previous blob or the new one, never a partial write.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Loads the blob stored under `key`.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(blob))`: A blob was stored
    /// - `Ok(None)`: Nothing has been stored under this key
    /// - `Err`: The store could not be read
    async fn load(&self, key: &str) -> Result<Option<StoredBlob>>;

    /// Replaces the blob stored under `key`.
    async fn save(&self, key: &str, blob: &StoredBlob) -> Result<()>;
}
