//! Origin fetcher contract.
//!
//! An origin response body is a single-use stream. Anything that needs the
//! bytes more than once buffers them first with [`buffer_body`] and works from
//! the resulting [`FetchedResponse`].

use std::time::Instant;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, StatusCode, header},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use http_body_util::BodyExt;
use thiserror::Error;
use url::Url;

use super::metadata::is_hop_by_hop;

#[derive(Debug, Error)]
pub enum OriginError {
    #[error("origin request to `{url}` failed: {message}")]
    Transport { url: String, message: String },
    #[error("origin request to `{url}` timed out")]
    Timeout { url: String },
    #[error("failed to read origin body: {0}")]
    Body(String),
}

impl OriginError {
    pub fn transport(url: &Url, message: impl Into<String>) -> Self {
        Self::Transport {
            url: url.to_string(),
            message: message.into(),
        }
    }

    pub fn timeout(url: &Url) -> Self {
        Self::Timeout {
            url: url.to_string(),
        }
    }
}

/// Response head plus an unread body stream.
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl OriginResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Body>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Stream the response back to a client without buffering it.
    pub fn into_streaming_response(self) -> Response {
        build_response(self.status, &self.headers, self.body)
    }
}

/// An origin response whose body has been read into memory exactly once.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FetchedResponse {
    pub fn into_response(self) -> Response {
        build_response(self.status, &self.headers, Body::from(self.body))
    }
}

#[async_trait]
pub trait OriginFetcher: Send + Sync {
    /// Perform a GET against `url`. Non-2xx statuses are responses, not errors.
    async fn fetch(&self, url: &Url) -> Result<OriginResponse, OriginError>;
}

/// Fetch and record the round-trip latency.
pub async fn timed_fetch(
    origin: &dyn OriginFetcher,
    url: &Url,
) -> Result<OriginResponse, OriginError> {
    let started = Instant::now();
    let result = origin.fetch(url).await;
    metrics::histogram!("dyncache_origin_fetch_ms").record(started.elapsed().as_secs_f64() * 1e3);
    result
}

pub enum BufferedBody {
    Complete(Bytes),
    /// The body exceeded the limit. The returned stream still yields every byte,
    /// starting with the part that was already read.
    Overflow(Body),
}

/// Read a body into memory, giving up (without losing data) once it grows past `limit`.
pub async fn buffer_body(mut body: Body, limit: usize) -> Result<BufferedBody, OriginError> {
    let mut buffered = BytesMut::new();

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|err| OriginError::Body(err.to_string()))?;
        // Trailers carry nothing worth caching.
        let Ok(chunk) = frame.into_data() else {
            continue;
        };
        if buffered.len() + chunk.len() > limit {
            let head = stream::iter([Ok::<Bytes, axum::Error>(buffered.freeze()), Ok(chunk)]);
            let rest = body.into_data_stream();
            return Ok(BufferedBody::Overflow(Body::from_stream(head.chain(rest))));
        }
        buffered.extend_from_slice(&chunk);
    }

    Ok(BufferedBody::Complete(buffered.freeze()))
}

/// Whether an origin response may be written to the store.
pub fn is_storable(status: StatusCode, headers: &HeaderMap) -> bool {
    if !status.is_success() {
        return false;
    }

    !headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
}

fn build_response(status: StatusCode, headers: &HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;

    let target = response.headers_mut();
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            target.append(name.clone(), value.clone());
        }
    }

    response
}
