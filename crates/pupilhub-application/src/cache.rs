//! In-memory mirror of one stored blob with coalesced background writes.

use futures::future::{BoxFuture, FutureExt, Shared};
use pupilhub_core::config::CacheConfig;
use pupilhub_core::{HubError, KeyValueStore, StoredBlob};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

type SharedLoad = Shared<BoxFuture<'static, StoredBlob>>;
type SharedWrite = Shared<BoxFuture<'static, ()>>;

#[derive(Default)]
struct WriterState {
    /// Bumped by every `save`; the writer loops until it persisted the latest.
    generation: u64,
    pending: Option<SharedWrite>,
    last_write: Option<Instant>,
    /// Set by `flush`, cleared when the writer task finishes.
    flush_requested: bool,
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    key: String,
    config: CacheConfig,
    data: Mutex<Option<StoredBlob>>,
    loading: Mutex<Option<SharedLoad>>,
    writer: Mutex<WriterState>,
    flush_signal: Notify,
    update_lock: Mutex<()>,
    last_error_log: Mutex<Option<Instant>>,
}

/// Debounced, rate-limited cache over a [`KeyValueStore`] key.
///
/// Persistence failures never reach callers. They are logged at most once
/// per cooldown window.
#[derive(Clone)]
pub struct DebouncedCache {
    inner: Arc<Inner>,
}

impl DebouncedCache {
    pub fn new(store: Arc<dyn KeyValueStore>, config: CacheConfig) -> Self {
        let key = config.storage_key.clone();
        Self {
            inner: Arc::new(Inner {
                store,
                key,
                config,
                data: Mutex::new(None),
                loading: Mutex::new(None),
                writer: Mutex::new(WriterState::default()),
                flush_signal: Notify::new(),
                update_lock: Mutex::new(()),
                last_error_log: Mutex::new(None),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Returns a copy of the cached blob, loading it on first use.
    ///
    /// Concurrent first loads share one read from the store.
    pub async fn load(&self) -> StoredBlob {
        if let Some(data) = self.inner.data.lock().await.clone() {
            return data;
        }

        let load = {
            let mut loading = self.inner.loading.lock().await;
            if let Some(data) = self.inner.data.lock().await.clone() {
                return data;
            }
            match loading.as_ref() {
                Some(load) => load.clone(),
                None => {
                    let inner = self.inner.clone();
                    let load = async move { inner.fetch().await }.boxed().shared();
                    *loading = Some(load.clone());
                    load
                }
            }
        };
        load.await
    }

    /// Replaces the cached blob and schedules a write. Returns immediately.
    pub async fn save(&self, blob: StoredBlob) {
        *self.inner.data.lock().await = Some(blob);
        self.schedule_write().await;
    }

    /// Load, mutate and save as one unit. Concurrent updates never
    /// interleave their mutators.
    pub async fn update<F>(&self, mutator: F) -> StoredBlob
    where
        F: FnOnce(&mut StoredBlob),
    {
        let _guard = self.inner.update_lock.lock().await;
        let mut blob = self.load().await;
        mutator(&mut blob);
        self.save(blob.clone()).await;
        blob
    }

    /// Waits for the pending write, if any, cutting its remaining delay short.
    pub async fn flush(&self) {
        let pending = {
            let mut writer = self.inner.writer.lock().await;
            if writer.pending.is_some() {
                writer.flush_requested = true;
            }
            writer.pending.clone()
        };
        if let Some(pending) = pending {
            self.inner.flush_signal.notify_waiters();
            pending.await;
        }
    }

    pub async fn has_pending_write(&self) -> bool {
        self.inner.writer.lock().await.pending.is_some()
    }

    async fn schedule_write(&self) {
        let mut writer = self.inner.writer.lock().await;
        writer.generation += 1;
        if writer.pending.is_some() {
            return;
        }

        let inner = self.inner.clone();
        let task = tokio::spawn(inner.write_loop());
        let pending = async move {
            if let Err(e) = task.await {
                tracing::error!(target: "pupilhub::cache", error = %e, "Cache writer task failed");
            }
        }
        .boxed()
        .shared();
        writer.pending = Some(pending);
    }
}

impl Inner {
    async fn fetch(self: Arc<Self>) -> StoredBlob {
        let blob = match self.store.load(&self.key).await {
            Ok(Some(blob)) => Some(blob),
            Ok(None) => Some(StoredBlob::new()),
            Err(e) => {
                self.log_failure("load", &e).await;
                None
            }
        };

        let result = {
            let mut data = self.data.lock().await;
            // A save that landed while loading wins.
            if let Some(current) = data.as_ref() {
                current.clone()
            } else if let Some(blob) = blob {
                *data = Some(blob.clone());
                blob
            } else {
                StoredBlob::new()
            }
        };
        *self.loading.lock().await = None;
        result
    }

    async fn write_loop(self: Arc<Self>) {
        loop {
            self.wait_or_flush(self.config.debounce()).await;

            let since_last = self.writer.lock().await.last_write.map(|at| at.elapsed());
            if let Some(elapsed) = since_last {
                let remaining = self.config.min_write_interval().saturating_sub(elapsed);
                if !remaining.is_zero() {
                    tracing::debug!(
                        target: "pupilhub::cache",
                        wait_ms = remaining.as_millis() as u64,
                        "Holding write for minimum interval"
                    );
                    self.wait_or_flush(remaining).await;
                }
            }

            // Generation before data: a save racing this read forces another pass.
            let written = self.writer.lock().await.generation;
            let snapshot = self.data.lock().await.clone();
            if let Some(blob) = snapshot {
                self.persist(&blob).await;
            }

            let mut writer = self.writer.lock().await;
            writer.last_write = Some(Instant::now());
            if writer.generation == written {
                writer.pending = None;
                writer.flush_requested = false;
                return;
            }
        }
    }

    async fn wait_or_flush(&self, duration: Duration) {
        let notified = self.flush_signal.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent flush is not lost.
        notified.as_mut().enable();
        if self.writer.lock().await.flush_requested {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = notified => {
                tracing::debug!(target: "pupilhub::cache", "Flush requested, writing now");
            }
        }
    }

    async fn persist(&self, blob: &StoredBlob) {
        match self.store.save(&self.key, blob).await {
            Ok(()) => tracing::debug!(
                target: "pupilhub::cache",
                key = %self.key,
                entries = blob.len(),
                "Cache written"
            ),
            Err(e) => self.log_failure("save", &e).await,
        }
    }

    async fn log_failure(&self, operation: &str, error: &HubError) {
        let mut last = self.last_error_log.lock().await;
        let now = Instant::now();
        let cooldown = self.config.error_log_cooldown();
        let cooled_down = last.is_none_or(|at| now.duration_since(at) >= cooldown);
        if cooled_down {
            *last = Some(now);
            tracing::warn!(
                target: "pupilhub::cache",
                key = %self.key,
                operation,
                error = %error,
                "Cache persistence failed"
            );
        } else {
            tracing::debug!(
                target: "pupilhub::cache",
                operation,
                "Cache persistence failed again, warning suppressed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use serde_json::json;

    fn blob(value: serde_json::Value) -> StoredBlob {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn cache(store: Arc<MemoryStore>) -> DebouncedCache {
        DebouncedCache::new(store, CacheConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_loads_share_one_read() {
        let store = MemoryStore::new();
        store.seed("pupilhub_data", blob(json!({"pupil_ids": ["a"]})));
        store.set_load_delay(Duration::from_millis(100));
        let cache = cache(store.clone());

        let (a, b, c) = tokio::join!(cache.load(), cache.load(), cache.load());

        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a["pupil_ids"], json!(["a"]));
        cache.load().await;
        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_returns_a_copy() {
        let store = MemoryStore::new();
        let cache = cache(store);

        let mut copy = cache.load().await;
        copy.insert("x".to_string(), json!(1));

        assert!(cache.load().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_is_deferred_until_flush() {
        let store = MemoryStore::new();
        let cache = cache(store.clone());

        cache.save(blob(json!({"k": 1}))).await;
        assert_eq!(store.save_count(), 0);
        assert!(cache.has_pending_write().await);

        cache.flush().await;
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.stored("pupilhub_data"), Some(blob(json!({"k": 1}))));
        assert!(!cache.has_pending_write().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_saves_coalesces() {
        let store = MemoryStore::new();
        let cache = cache(store.clone());

        for i in 0..5 {
            cache.save(blob(json!({"n": i}))).await;
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(store.save_count(), 1);
        assert_eq!(store.stored("pupilhub_data"), Some(blob(json!({"n": 4}))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_interval_between_writes() {
        let store = MemoryStore::new();
        let cache = cache(store.clone());

        cache.save(blob(json!({"n": 1}))).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.save_count(), 1);

        cache.save(blob(json!({"n": 2}))).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.save_count(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.save_count(), 2);
        assert_eq!(store.stored("pupilhub_data"), Some(blob(json!({"n": 2}))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failures_are_swallowed() {
        let store = MemoryStore::new();
        store.set_fail_saves(true);
        let cache = cache(store.clone());

        cache.save(blob(json!({"n": 1}))).await;
        cache.flush().await;
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.stored("pupilhub_data"), None);

        store.set_fail_saves(false);
        cache.save(blob(json!({"n": 2}))).await;
        cache.flush().await;
        assert_eq!(store.stored("pupilhub_data"), Some(blob(json!({"n": 2}))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_updates_do_not_interleave() {
        let store = MemoryStore::new();
        let cache = cache(store.clone());

        let bump = |blob: &mut StoredBlob| {
            let n = blob.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            blob.insert("n".to_string(), json!(n + 1));
        };
        tokio::join!(cache.update(bump), cache.update(bump), cache.update(bump));
        cache.flush().await;

        assert_eq!(store.stored("pupilhub_data"), Some(blob(json!({"n": 3}))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushed_blob_reloads_through_a_new_cache() {
        let store = MemoryStore::new();
        let saved = blob(json!({
            "pupil_ids": ["1", "2"],
            "pupil_data": {"1": {"schedule_status": "fresh", "schedule": [{"date": "2024-09-02"}]}},
            "last_auth_success": null,
        }));

        let first = cache(store.clone());
        first.save(saved.clone()).await;
        first.flush().await;

        let second = cache(store);
        assert_eq!(second.load().await, saved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_during_write_keeps_next_debounce() {
        let store = MemoryStore::new();
        store.set_save_delay(Duration::from_secs(1));
        let config = CacheConfig {
            min_write_interval_secs: 0,
            ..CacheConfig::default()
        };
        let cache = DebouncedCache::new(store.clone(), config);

        cache.save(blob(json!({"n": 1}))).await;
        // Debounce ends at 2s; the write then takes until 3s.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cache.flush().await;
        assert_eq!(store.stored("pupilhub_data"), Some(blob(json!({"n": 1}))));

        cache.save(blob(json!({"n": 2}))).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.save_count(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.save_count(), 2);
        assert_eq!(store.stored("pupilhub_data"), Some(blob(json!({"n": 2}))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_without_pending_write_returns() {
        let store = MemoryStore::new();
        let cache = cache(store.clone());

        cache.flush().await;
        assert_eq!(store.save_count(), 0);
    }
}
