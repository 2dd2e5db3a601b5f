#![allow(dead_code)]

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, Bytes, to_bytes},
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header},
    response::Response,
};
use dyncache::{
    application::proxy::ProxyService,
    cache::{
        CacheConfig, CacheEngine, EntryMetadata, EntryTier, KvRecord, KvStore, MemoryKvStore,
        OriginError, OriginFetcher, OriginResponse, ResourceKey, StoreError, StoredEntry,
    },
    infra::http::{HttpState, build_router},
};
use tokio::sync::Semaphore;
use tower::ServiceExt;
use url::Url;

pub const ORIGIN: &str = "https://origin.test/";
pub const COLLECTION: &str = "/posts/";

/// Origin double that answers every GET with the current scripted body.
pub struct ScriptedOrigin {
    body: Mutex<String>,
    status: Mutex<StatusCode>,
    extra_headers: Mutex<HeaderMap>,
    requested: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedOrigin {
    pub fn new(body: &str) -> Self {
        Self {
            body: Mutex::new(body.to_string()),
            status: Mutex::new(StatusCode::OK),
            extra_headers: Mutex::new(HeaderMap::new()),
            requested: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// An origin whose responses wait until the returned semaphore hands out permits.
    pub fn gated(body: &str) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let origin = Self {
            gate: Some(gate.clone()),
            ..Self::new(body)
        };
        (origin, gate)
    }

    pub fn set_body(&self, body: &str) {
        *self.body.lock().expect("body lock") = body.to_string();
    }

    pub fn set_status(&self, status: StatusCode) {
        *self.status.lock().expect("status lock") = status;
    }

    pub fn insert_header(&self, name: header::HeaderName, value: &'static str) {
        self.extra_headers
            .lock()
            .expect("headers lock")
            .append(name, HeaderValue::from_static(value));
    }

    pub fn calls(&self) -> usize {
        self.requested.lock().expect("requested lock").len()
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().expect("requested lock").clone()
    }
}

#[async_trait]
impl OriginFetcher for ScriptedOrigin {
    async fn fetch(&self, url: &Url) -> Result<OriginResponse, OriginError> {
        self.requested
            .lock()
            .expect("requested lock")
            .push(url.to_string());

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .expect("gate stays open")
                .forget();
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        for (name, value) in self.extra_headers.lock().expect("headers lock").iter() {
            headers.append(name.clone(), value.clone());
        }

        let status = *self.status.lock().expect("status lock");
        let body = self.body.lock().expect("body lock").clone();
        Ok(OriginResponse::new(status, headers, body))
    }
}

/// In-memory store that records every call made through the `KvStore` contract.
///
/// Reads and deletes can be made to fail for individual keys.
pub struct RecordingStore {
    inner: MemoryKvStore,
    gets: AtomicUsize,
    puts: Mutex<Vec<String>>,
    deletes: AtomicUsize,
    failing_gets: Mutex<HashSet<String>>,
    failing_deletes: Mutex<HashSet<String>>,
}

impl RecordingStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: MemoryKvStore::new(config),
            gets: AtomicUsize::new(0),
            puts: Mutex::new(Vec::new()),
            deletes: AtomicUsize::new(0),
            failing_gets: Mutex::new(HashSet::new()),
            failing_deletes: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_gets_of(&self, key: &str) {
        self.failing_gets
            .lock()
            .expect("failing gets lock")
            .insert(key.to_string());
    }

    pub fn fail_deletes_of(&self, key: &str) {
        self.failing_deletes
            .lock()
            .expect("failing deletes lock")
            .insert(key.to_string());
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> Vec<String> {
        self.puts.lock().expect("puts lock").clone()
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Read an entry without recording the call.
    pub async fn peek(&self, key: &str) -> Option<StoredEntry> {
        self.inner
            .get_with_metadata(key)
            .await
            .expect("memory store never fails")
            .into_entry()
    }

    /// Write an entry without recording the call.
    pub async fn seed(&self, key: &str, body: &str, ttl: Duration) {
        let metadata = EntryMetadata::new(vec![(
            "content-type".to_string(),
            "application/json".to_string(),
        )]);
        self.inner
            .put(key, Bytes::from(body.to_string()), &metadata, ttl)
            .await
            .expect("memory store never fails");
    }
}

#[async_trait]
impl KvStore for RecordingStore {
    async fn get_with_metadata(&self, key: &str) -> Result<KvRecord, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.failing_gets.lock().expect("failing gets lock").contains(key) {
            return Err(StoreError::unavailable(format!("read of `{key}` refused")));
        }
        self.inner.get_with_metadata(key).await
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        metadata: &EntryMetadata,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.puts.lock().expect("puts lock").push(key.to_string());
        self.inner.put(key, value, metadata, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.failing_deletes.lock().expect("failing deletes lock").contains(key) {
            return Err(StoreError::unavailable(format!("delete of `{key}` refused")));
        }
        self.inner.delete(key).await
    }
}

pub struct Harness {
    pub router: Router,
    pub proxy: Arc<ProxyService>,
    pub store: Arc<RecordingStore>,
    pub origin: Arc<ScriptedOrigin>,
    pub config: CacheConfig,
}

impl Harness {
    pub fn new(origin: ScriptedOrigin) -> Self {
        Self::with_config(CacheConfig::default(), origin)
    }

    pub fn with_config(config: CacheConfig, origin: ScriptedOrigin) -> Self {
        let store = Arc::new(RecordingStore::new(&config));
        let origin = Arc::new(origin);
        let engine = CacheEngine::new(config.clone(), store.clone(), origin.clone());
        let proxy = Arc::new(ProxyService::new(
            engine,
            Url::parse(ORIGIN).expect("origin url"),
            vec![COLLECTION.to_string()],
        ));
        let router = build_router(HttpState {
            proxy: proxy.clone(),
        });

        Self {
            router,
            proxy,
            store,
            origin,
            config,
        }
    }

    pub fn resource() -> ResourceKey {
        ResourceKey::new(Url::parse(ORIGIN).expect("origin url").join(COLLECTION).expect("url"))
    }

    pub fn key(tier: EntryTier) -> String {
        Self::resource().entry_key(tier)
    }

    pub async fn seed(&self, tier: EntryTier, body: &str) {
        let ttl = match tier {
            EntryTier::Fresh => self.config.fresh_ttl(),
            EntryTier::Stale => self.config.stale_ttl(),
        };
        self.store.seed(&Self::key(tier), body, ttl).await;
    }

    pub async fn entry_body(&self, tier: EntryTier) -> Option<String> {
        self.store
            .peek(&Self::key(tier))
            .await
            .map(|entry| String::from_utf8(entry.value.to_vec()).expect("utf8 body"))
    }

    pub async fn send(&self, method: Method, uri: &str) -> Response {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("request should build");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond")
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, HeaderMap, String) {
        let response = self.send(Method::GET, uri).await;
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should collect");
        let body = String::from_utf8(bytes.to_vec()).expect("utf8 body");
        (status, headers, body)
    }

    /// Wait for every scheduled refresh to finish.
    pub async fn settle(&self) {
        assert!(
            self.proxy
                .engine()
                .scheduler()
                .drain(Duration::from_secs(5))
                .await,
            "background refreshes did not finish"
        );
    }
}
