//! Cache consistency engine.
//!
//! Each resource lives under two keys: a short-lived fresh entry and a
//! long-lived stale entry. Lookups go fresh → stale → origin:
//!
//! - fresh hit: served as-is, nothing else happens;
//! - stale hit: served immediately, a refresh is scheduled in the background;
//! - miss: the origin response is read once, returned to the client, and the
//!   same bytes are handed to a background refresh that writes both entries.
//!
//! Store faults never reach the client. A failed lookup is a miss, a failed
//! write is logged and retried implicitly by the next request that misses.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::application::error::HttpError;

use super::{
    config::CacheConfig,
    keys::{EntryTier, ResourceKey},
    metadata::EntryMetadata,
    origin::{
        BufferedBody, FetchedResponse, OriginError, OriginFetcher, OriginResponse, buffer_body,
        is_storable, timed_fetch,
    },
    scheduler::RefreshScheduler,
    store::{KvStore, StoreError, StoredEntry},
};

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Where a resolved response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveSource {
    Fresh,
    Stale,
    Origin,
}

impl ResolveSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolveSource::Fresh => "fresh",
            ResolveSource::Stale => "stale",
            ResolveSource::Origin => "origin",
        }
    }

    fn x_cache(self) -> HeaderValue {
        match self {
            ResolveSource::Fresh => HeaderValue::from_static("HIT"),
            ResolveSource::Stale => HeaderValue::from_static("STALE"),
            ResolveSource::Origin => HeaderValue::from_static("MISS"),
        }
    }
}

pub struct Resolution {
    pub source: ResolveSource,
    pub response: Response,
}

impl Resolution {
    fn from_entry(source: ResolveSource, entry: StoredEntry) -> Self {
        let mut response = Response::new(Body::from(entry.value));
        *response.headers_mut() = entry.metadata.to_header_map();
        Self { source, response }
    }

    fn from_origin(response: Response) -> Self {
        Self {
            source: ResolveSource::Origin,
            response,
        }
    }

    fn origin_failure(error: OriginError) -> Self {
        Self::from_origin(HttpError::from(error).into_response())
    }
}

impl IntoResponse for Resolution {
    fn into_response(self) -> Response {
        let mut response = self.response;
        response.headers_mut().insert(X_CACHE, self.source.x_cache());
        response
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Both entries were written.
    Stored { bytes: usize },
    /// The origin answered with something that must not be cached.
    Skipped { reason: &'static str },
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Origin(#[from] OriginError),
    #[error("failed to write {tier} entry: {source}")]
    Store {
        tier: &'static str,
        #[source]
        source: StoreError,
    },
}

/// Result of deleting both entries of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invalidation {
    pub fresh_deleted: bool,
    pub stale_deleted: bool,
}

impl Invalidation {
    pub fn is_complete(&self) -> bool {
        self.fresh_deleted && self.stale_deleted
    }
}

#[derive(Clone)]
pub struct CacheEngine {
    config: CacheConfig,
    store: Arc<dyn KvStore>,
    origin: Arc<dyn OriginFetcher>,
    scheduler: RefreshScheduler,
}

impl CacheEngine {
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn KvStore>,
        origin: Arc<dyn OriginFetcher>,
    ) -> Self {
        let scheduler = RefreshScheduler::new(config.single_flight_refresh);
        Self {
            config,
            store,
            origin,
            scheduler,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    /// Serve a resource, preferring fresh cache, then stale cache, then origin.
    #[instrument(skip_all, fields(url = %key))]
    pub async fn resolve(&self, key: &ResourceKey) -> Resolution {
        if let Some(entry) = self.lookup(key, EntryTier::Fresh).await {
            debug!(cache = "fresh", outcome = "hit", "serving fresh entry");
            metrics::counter!("dyncache_cache_fresh_hit_total").increment(1);
            return Resolution::from_entry(ResolveSource::Fresh, entry);
        }

        if let Some(entry) = self.lookup(key, EntryTier::Stale).await {
            debug!(
                cache = "stale",
                outcome = "hit",
                "serving stale entry, scheduling refresh"
            );
            metrics::counter!("dyncache_cache_stale_hit_total").increment(1);
            self.schedule_refresh(key.clone(), None);
            return Resolution::from_entry(ResolveSource::Stale, entry);
        }

        debug!(cache = "stale", outcome = "miss", "fetching from origin");
        metrics::counter!("dyncache_cache_miss_total").increment(1);
        self.fetch_on_miss(key).await
    }

    async fn fetch_on_miss(&self, key: &ResourceKey) -> Resolution {
        let OriginResponse {
            status,
            headers,
            body,
        } = match timed_fetch(self.origin.as_ref(), key.url()).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "origin fetch failed on cache miss");
                return Resolution::origin_failure(err);
            }
        };

        if !is_storable(status, &headers) {
            debug!(status = status.as_u16(), "origin response is not cacheable");
            return Resolution::from_origin(
                OriginResponse::new(status, headers, body).into_streaming_response(),
            );
        }

        match buffer_body(body, self.config.max_body_bytes).await {
            Ok(BufferedBody::Complete(body)) => {
                let fetched = FetchedResponse {
                    status,
                    headers,
                    body,
                };
                self.schedule_refresh(key.clone(), Some(fetched.clone()));
                Resolution::from_origin(fetched.into_response())
            }
            Ok(BufferedBody::Overflow(body)) => {
                warn!(
                    limit = self.config.max_body_bytes,
                    "origin body exceeds cache limit, serving uncached"
                );
                Resolution::from_origin(
                    OriginResponse::new(status, headers, body).into_streaming_response(),
                )
            }
            Err(err) => {
                warn!(error = %err, "failed to read origin body on cache miss");
                Resolution::origin_failure(err)
            }
        }
    }

    /// Rewrite both entries of a resource.
    ///
    /// Uses `fetched` when given, otherwise performs its own origin fetch. The
    /// stale entry is written before the fresh one; both writes are always
    /// attempted.
    #[instrument(skip_all, fields(url = %key))]
    pub async fn refresh(
        &self,
        key: &ResourceKey,
        fetched: Option<FetchedResponse>,
    ) -> Result<RefreshOutcome, RefreshError> {
        let fetched = match fetched {
            Some(fetched) => fetched,
            None => match self.fetch_for_refresh(key).await? {
                Some(fetched) => fetched,
                None => {
                    return Ok(RefreshOutcome::Skipped {
                        reason: "origin response not cacheable",
                    });
                }
            },
        };

        if !is_storable(fetched.status, &fetched.headers) {
            return Ok(RefreshOutcome::Skipped {
                reason: "origin response not cacheable",
            });
        }

        let metadata = EntryMetadata::capture(&fetched.headers);
        let bytes = fetched.body.len();

        let stale = self
            .write(key, EntryTier::Stale, fetched.body.clone(), &metadata)
            .await;
        let fresh = self
            .write(key, EntryTier::Fresh, fetched.body, &metadata)
            .await;

        stale.and(fresh)?;
        Ok(RefreshOutcome::Stored { bytes })
    }

    async fn fetch_for_refresh(
        &self,
        key: &ResourceKey,
    ) -> Result<Option<FetchedResponse>, RefreshError> {
        let OriginResponse {
            status,
            headers,
            body,
        } = timed_fetch(self.origin.as_ref(), key.url()).await?;

        if !is_storable(status, &headers) {
            warn!(
                status = status.as_u16(),
                "origin refused refresh, keeping existing entries"
            );
            return Ok(None);
        }

        match buffer_body(body, self.config.max_body_bytes).await? {
            BufferedBody::Complete(body) => Ok(Some(FetchedResponse {
                status,
                headers,
                body,
            })),
            BufferedBody::Overflow(_) => {
                warn!(
                    limit = self.config.max_body_bytes,
                    "origin body exceeds cache limit, not storing"
                );
                Ok(None)
            }
        }
    }

    /// Delete both entries of a resource. Each delete is attempted regardless of
    /// the other's outcome.
    #[instrument(skip_all, fields(url = %key))]
    pub async fn invalidate(&self, key: &ResourceKey) -> Invalidation {
        let fresh_key = key.fresh_key();
        let stale_key = key.stale_key();
        let (fresh, stale) = futures::join!(
            self.store.delete(&fresh_key),
            self.store.delete(&stale_key),
        );

        metrics::counter!("dyncache_invalidate_total").increment(1);

        let invalidation = Invalidation {
            fresh_deleted: log_delete(EntryTier::Fresh, fresh),
            stale_deleted: log_delete(EntryTier::Stale, stale),
        };
        if invalidation.is_complete() {
            info!("invalidated cached resource");
        }
        invalidation
    }

    /// Fetch `url` from the origin and stream the answer back verbatim.
    ///
    /// Never reads or writes the store.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn pass_through(&self, url: &Url) -> Response {
        metrics::counter!("dyncache_passthrough_total").increment(1);
        match timed_fetch(self.origin.as_ref(), url).await {
            Ok(response) => response.into_streaming_response(),
            Err(err) => {
                warn!(error = %err, "pass-through fetch failed");
                HttpError::from(err).into_response()
            }
        }
    }

    fn schedule_refresh(&self, key: ResourceKey, fetched: Option<FetchedResponse>) {
        let engine = self.clone();
        let scheduled_key = key.to_string();
        self.scheduler.spawn(scheduled_key, async move {
            match engine.refresh(&key, fetched).await {
                Ok(RefreshOutcome::Stored { bytes }) => {
                    debug!(url = %key, bytes, "refreshed cached resource");
                    metrics::counter!("dyncache_refresh_total").increment(1);
                }
                Ok(RefreshOutcome::Skipped { reason }) => {
                    debug!(url = %key, reason, "refresh skipped");
                    metrics::counter!("dyncache_refresh_skipped_total").increment(1);
                }
                Err(err) => {
                    warn!(url = %key, error = %err, "background refresh failed");
                    metrics::counter!("dyncache_refresh_failed_total").increment(1);
                }
            }
        });
    }

    async fn lookup(&self, key: &ResourceKey, tier: EntryTier) -> Option<StoredEntry> {
        match self.store.get_with_metadata(&key.entry_key(tier)).await {
            Ok(record) => record.into_entry(),
            Err(err) => {
                warn!(
                    tier = tier.as_str(),
                    error = %err,
                    "store lookup failed, treating as miss"
                );
                None
            }
        }
    }

    async fn write(
        &self,
        key: &ResourceKey,
        tier: EntryTier,
        body: Bytes,
        metadata: &EntryMetadata,
    ) -> Result<(), RefreshError> {
        let ttl = match tier {
            EntryTier::Fresh => self.config.fresh_ttl(),
            EntryTier::Stale => self.config.stale_ttl(),
        };

        self.store
            .put(&key.entry_key(tier), body, metadata, ttl)
            .await
            .map_err(|source| {
                error!(tier = tier.as_str(), error = %source, "store write failed");
                RefreshError::Store {
                    tier: tier.as_str(),
                    source,
                }
            })
    }
}

fn log_delete(tier: EntryTier, result: Result<(), StoreError>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            warn!(tier = tier.as_str(), error = %err, "failed to delete cache entry");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use axum::http::{HeaderMap, StatusCode, header};

    use super::*;
    use crate::cache::store::{KvRecord, MemoryKvStore};

    struct ScriptedOrigin {
        status: StatusCode,
        body: Mutex<&'static str>,
        calls: AtomicUsize,
    }

    impl ScriptedOrigin {
        fn ok(body: &'static str) -> Self {
            Self {
                status: StatusCode::OK,
                body: Mutex::new(body),
                calls: AtomicUsize::new(0),
            }
        }

        fn status(status: StatusCode) -> Self {
            Self {
                status,
                body: Mutex::new("error"),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OriginFetcher for ScriptedOrigin {
        async fn fetch(&self, _url: &Url) -> Result<OriginResponse, OriginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            let body = *self.body.lock().expect("body lock");
            Ok(OriginResponse::new(self.status, headers, body))
        }
    }

    /// Store whose every operation fails.
    struct BrokenStore;

    #[async_trait]
    impl KvStore for BrokenStore {
        async fn get_with_metadata(&self, _key: &str) -> Result<KvRecord, StoreError> {
            Err(StoreError::unavailable("down"))
        }

        async fn put(
            &self,
            _key: &str,
            _value: Bytes,
            _metadata: &EntryMetadata,
            _ttl: Duration,
        ) -> Result<(), StoreError> {
            Err(StoreError::unavailable("down"))
        }

        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::unavailable("down"))
        }
    }

    fn resource() -> ResourceKey {
        ResourceKey::new(Url::parse("https://origin.test/posts/").expect("url"))
    }

    fn engine_with(
        store: Arc<dyn KvStore>,
        origin: Arc<dyn OriginFetcher>,
    ) -> CacheEngine {
        CacheEngine::new(CacheConfig::default(), store, origin)
    }

    async fn body_of(resolution: Resolution) -> Bytes {
        axum::body::to_bytes(resolution.response.into_body(), usize::MAX)
            .await
            .expect("body")
    }

    #[tokio::test]
    async fn miss_then_fresh_hit() {
        let config = CacheConfig::default();
        let store = Arc::new(MemoryKvStore::new(&config));
        let origin = Arc::new(ScriptedOrigin::ok("{\"posts\":[]}"));
        let engine = engine_with(store.clone(), origin.clone());

        let first = engine.resolve(&resource()).await;
        assert_eq!(first.source, ResolveSource::Origin);
        assert_eq!(body_of(first).await, Bytes::from_static(b"{\"posts\":[]}"));
        assert!(engine.scheduler().drain(Duration::from_secs(5)).await);

        let second = engine.resolve(&resource()).await;
        assert_eq!(second.source, ResolveSource::Fresh);
        assert_eq!(origin.calls(), 1);
    }

    #[tokio::test]
    async fn refresh_writes_both_tiers_from_supplied_response() {
        let config = CacheConfig::default();
        let store = Arc::new(MemoryKvStore::new(&config));
        let origin = Arc::new(ScriptedOrigin::ok("unused"));
        let engine = engine_with(store.clone(), origin.clone());

        let fetched = FetchedResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"supplied"),
        };
        let outcome = engine
            .refresh(&resource(), Some(fetched))
            .await
            .expect("refresh");

        assert_eq!(outcome, RefreshOutcome::Stored { bytes: 8 });
        assert_eq!(origin.calls(), 0);
        for key in [resource().fresh_key(), resource().stale_key()] {
            let entry = store
                .get_with_metadata(&key)
                .await
                .expect("get")
                .into_entry()
                .expect("entry written");
            assert_eq!(entry.value, Bytes::from_static(b"supplied"));
        }
    }

    #[tokio::test]
    async fn refresh_skips_failed_origin_responses() {
        let config = CacheConfig::default();
        let store = Arc::new(MemoryKvStore::new(&config));
        let origin = Arc::new(ScriptedOrigin::status(StatusCode::SERVICE_UNAVAILABLE));
        let engine = engine_with(store.clone(), origin);

        let outcome = engine.refresh(&resource(), None).await.expect("refresh");
        assert!(matches!(outcome, RefreshOutcome::Skipped { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn non_success_miss_is_passed_through_without_refresh() {
        let config = CacheConfig::default();
        let store = Arc::new(MemoryKvStore::new(&config));
        let origin = Arc::new(ScriptedOrigin::status(StatusCode::NOT_FOUND));
        let engine = engine_with(store.clone(), origin);

        let resolution = engine.resolve(&resource()).await;
        assert_eq!(resolution.source, ResolveSource::Origin);
        assert_eq!(resolution.response.status(), StatusCode::NOT_FOUND);
        assert_eq!(engine.scheduler().pending(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn broken_store_degrades_to_origin() {
        let origin = Arc::new(ScriptedOrigin::ok("live"));
        let engine = engine_with(Arc::new(BrokenStore), origin.clone());

        let resolution = engine.resolve(&resource()).await;
        assert_eq!(resolution.source, ResolveSource::Origin);
        assert_eq!(resolution.response.status(), StatusCode::OK);
        assert_eq!(body_of(resolution).await, Bytes::from_static(b"live"));
        assert!(engine.scheduler().drain(Duration::from_secs(5)).await);
        assert_eq!(origin.calls(), 1);
    }

    #[tokio::test]
    async fn refresh_reports_store_failures() {
        let origin = Arc::new(ScriptedOrigin::ok("live"));
        let engine = engine_with(Arc::new(BrokenStore), origin);

        let err = engine
            .refresh(&resource(), None)
            .await
            .expect_err("writes fail");
        assert!(matches!(err, RefreshError::Store { tier: "stale", .. }));
    }

    #[tokio::test]
    async fn unrepresentable_ttl_fails_the_refresh_instead_of_panicking() {
        let config = CacheConfig {
            stale_ttl_seconds: u64::MAX,
            ..Default::default()
        };
        let store = Arc::new(MemoryKvStore::new(&config));
        let origin = Arc::new(ScriptedOrigin::ok("live"));
        let engine = CacheEngine::new(config, store.clone(), origin);

        let err = engine
            .refresh(&resource(), None)
            .await
            .expect_err("stale write overflows");
        assert!(matches!(
            err,
            RefreshError::Store {
                tier: "stale",
                source: StoreError::TtlOutOfRange { .. },
            }
        ));
        assert!(
            store
                .get_with_metadata(&resource().stale_key())
                .await
                .expect("get")
                .value
                .is_none()
        );
    }

    #[tokio::test]
    async fn invalidate_attempts_both_deletes() {
        let origin = Arc::new(ScriptedOrigin::ok("live"));
        let engine = engine_with(Arc::new(BrokenStore), origin);

        let invalidation = engine.invalidate(&resource()).await;
        assert!(!invalidation.fresh_deleted);
        assert!(!invalidation.stale_deleted);
        assert!(!invalidation.is_complete());
    }

    #[tokio::test]
    async fn oversized_body_is_served_but_not_stored() {
        let config = CacheConfig {
            max_body_bytes: 4,
            ..Default::default()
        };
        let store = Arc::new(MemoryKvStore::new(&config));
        let origin = Arc::new(ScriptedOrigin::ok("far too large"));
        let engine = CacheEngine::new(config, store.clone(), origin);

        let resolution = engine.resolve(&resource()).await;
        assert_eq!(body_of(resolution).await, Bytes::from_static(b"far too large"));
        assert!(engine.scheduler().drain(Duration::from_secs(5)).await);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn pass_through_leaves_store_untouched() {
        let config = CacheConfig::default();
        let store = Arc::new(MemoryKvStore::new(&config));
        let origin = Arc::new(ScriptedOrigin::ok("detail"));
        let engine = engine_with(store.clone(), origin.clone());

        let url = Url::parse("https://origin.test/posts/1").expect("url");
        let response = engine.pass_through(&url).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(X_CACHE).is_none());
        assert_eq!(origin.calls(), 1);
        assert_eq!(engine.scheduler().pending(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn x_cache_header_reflects_source() {
        let resolution = Resolution::from_origin(Response::new(Body::empty()));
        let response = resolution.into_response();
        assert_eq!(response.headers()[X_CACHE], "MISS");
    }
}
