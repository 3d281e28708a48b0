//! Test doubles for the transport and store boundaries.

use async_trait::async_trait;
use pupilhub_core::{
    HttpRequest, HttpResponse, HttpTransport, HubError, KeyValueStore, Result, StoredBlob,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Handler = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync>;

/// Replays queued responses in order, then falls back to a handler.
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse>>>,
    handler: Mutex<Option<Handler>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            handler: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn with_handler<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    {
        let transport = Self::new();
        *transport.handler.lock().unwrap() = Some(Box::new(handler));
        transport
    }

    pub(crate) fn respond(&self, status: u16, body: &str) {
        self.respond_with(HttpResponse::new(status, "https://scripted.example/", body));
    }

    pub(crate) fn respond_with(&self, response: HttpResponse) {
        self.script.lock().unwrap().push_back(Ok(response));
    }

    pub(crate) fn fail(&self, err: HubError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.url).collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }
        match self.handler.lock().unwrap().as_ref() {
            Some(handler) => handler(&request),
            None => Err(HubError::connection(format!("no scripted response for {}", request.url))),
        }
    }
}

/// In-memory store that counts calls and can be told to fail or stall.
#[derive(Default)]
pub(crate) struct MemoryStore {
    blobs: Mutex<HashMap<String, StoredBlob>>,
    pub(crate) loads: AtomicUsize,
    pub(crate) saves: AtomicUsize,
    fail_saves: Mutex<bool>,
    load_delay: Mutex<Duration>,
    save_delay: Mutex<Duration>,
}

impl MemoryStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn seed(&self, key: &str, blob: StoredBlob) {
        self.blobs.lock().unwrap().insert(key.to_string(), blob);
    }

    pub(crate) fn stored(&self, key: &str) -> Option<StoredBlob> {
        self.blobs.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn set_fail_saves(&self, fail: bool) {
        *self.fail_saves.lock().unwrap() = fail;
    }

    pub(crate) fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock().unwrap() = delay;
    }

    pub(crate) fn set_save_delay(&self, delay: Duration) {
        *self.save_delay.lock().unwrap() = delay;
    }

    pub(crate) fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub(crate) fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<StoredBlob>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.load_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.stored(key))
    }

    async fn save(&self, key: &str, blob: &StoredBlob) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let delay = *self.save_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_saves.lock().unwrap() {
            return Err(HubError::store_write("disk full"));
        }
        self.blobs.lock().unwrap().insert(key.to_string(), blob.clone());
        Ok(())
    }
}
