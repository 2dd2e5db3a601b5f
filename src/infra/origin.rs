//! `reqwest`-backed origin fetcher.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use reqwest::{Client, redirect};
use tracing::debug;
use url::Url;

use crate::cache::{OriginError, OriginFetcher, OriginResponse};

use super::error::InfraError;

#[derive(Clone, Debug)]
pub struct HttpOriginFetcher {
    client: Client,
}

impl HttpOriginFetcher {
    pub fn new(timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|err| {
                InfraError::configuration(format!("failed to build origin client: {err}"))
            })?;
        Ok(Self { client })
    }

    pub fn user_agent() -> &'static str {
        concat!("dyncache/", env!("CARGO_PKG_VERSION"))
    }
}

#[async_trait]
impl OriginFetcher for HttpOriginFetcher {
    async fn fetch(&self, url: &Url) -> Result<OriginResponse, OriginError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    OriginError::timeout(url)
                } else {
                    OriginError::transport(url, err.to_string())
                }
            })?;

        let status = response.status();
        debug!(url = %url, status = status.as_u16(), "origin responded");

        let headers = response.headers().clone();
        let body = Body::from_stream(response.bytes_stream());
        Ok(OriginResponse::new(status, headers, body))
    }
}
