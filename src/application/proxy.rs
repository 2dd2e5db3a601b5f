//! Maps inbound collection paths onto the cache engine.

use axum::{
    http::Uri,
    response::{IntoResponse, Redirect, Response},
};
use tracing::info;
use url::Url;

use crate::{
    application::error::AppError,
    cache::{CacheEngine, ResourceKey},
};

/// How an inbound path relates to the configured collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMatch<'a> {
    /// The path is exactly a collection and is served through the cache.
    Collection(&'a str),
    /// The path lies below a collection and goes straight to the origin.
    PassThrough(&'a str),
    Unknown,
}

pub struct ProxyService {
    engine: CacheEngine,
    origin_base: Url,
    collections: Vec<String>,
}

impl ProxyService {
    pub fn new(engine: CacheEngine, origin_base: Url, collections: Vec<String>) -> Self {
        Self {
            engine,
            origin_base,
            collections,
        }
    }

    pub fn engine(&self) -> &CacheEngine {
        &self.engine
    }

    pub fn collections(&self) -> &[String] {
        &self.collections
    }

    pub fn classify<'a>(&'a self, path: &str) -> RouteMatch<'a> {
        for collection in &self.collections {
            if path == collection {
                return RouteMatch::Collection(collection);
            }
            if path.starts_with(collection.as_str()) {
                return RouteMatch::PassThrough(collection);
            }
        }
        RouteMatch::Unknown
    }

    /// Origin URL for an inbound path, keeping the origin's scheme and authority.
    pub fn origin_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.origin_base.clone();
        url.set_path(path);
        url.set_query(query);
        url
    }

    fn resource(&self, collection: &str) -> ResourceKey {
        ResourceKey::new(self.origin_url(collection, None))
    }

    pub async fn resolve_collection(&self, path: &str) -> Response {
        match self.classify(path) {
            RouteMatch::Collection(collection) => self
                .engine
                .resolve(&self.resource(collection))
                .await
                .into_response(),
            _ => AppError::NotFound.into_response(),
        }
    }

    /// Drop both cache entries and send the client back to the collection.
    pub async fn invalidate_collection(&self, path: &str) -> Response {
        let RouteMatch::Collection(collection) = self.classify(path) else {
            return AppError::NotFound.into_response();
        };

        let invalidation = self.engine.invalidate(&self.resource(collection)).await;
        if !invalidation.is_complete() {
            info!(
                collection,
                fresh_deleted = invalidation.fresh_deleted,
                stale_deleted = invalidation.stale_deleted,
                "partial invalidation, redirecting anyway"
            );
        }
        Redirect::to(collection).into_response()
    }

    pub async fn pass_through(&self, uri: &Uri) -> Response {
        match self.classify(uri.path()) {
            RouteMatch::PassThrough(_) => {
                let url = self.origin_url(uri.path(), uri.query());
                self.engine.pass_through(&url).await
            }
            _ => AppError::NotFound.into_response(),
        }
    }
}
