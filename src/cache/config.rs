//! Cache configuration.
//!
//! Controls entry lifetimes, store sizing and refresh behaviour via `dyncache.toml`.

use std::{num::NonZeroUsize, time::Duration};

use serde::Deserialize;

// Default values for cache configuration
pub(crate) const DEFAULT_FRESH_TTL_SECS: u64 = 60;
pub(crate) const DEFAULT_STALE_TTL_SECS: u64 = 60 * 60;
pub(crate) const DEFAULT_STORE_CAPACITY: usize = 1024;
pub(crate) const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
/// Longest lifetime accepted for either entry.
pub(crate) const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Cache configuration from `dyncache.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of the fresh entry in seconds.
    pub fresh_ttl_seconds: u64,
    /// Lifetime of the stale entry in seconds. Always longer than the fresh one.
    pub stale_ttl_seconds: u64,
    /// Maximum number of keys held by the in-memory store.
    pub store_capacity: usize,
    /// Largest origin body that will be written to the store.
    pub max_body_bytes: usize,
    /// Skip a refresh when one for the same resource is already running.
    pub single_flight_refresh: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fresh_ttl_seconds: DEFAULT_FRESH_TTL_SECS,
            stale_ttl_seconds: DEFAULT_STALE_TTL_SECS,
            store_capacity: DEFAULT_STORE_CAPACITY,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            single_flight_refresh: false,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            fresh_ttl_seconds: settings.fresh_ttl.as_secs(),
            stale_ttl_seconds: settings.stale_ttl.as_secs(),
            store_capacity: settings.store_capacity.get(),
            max_body_bytes: settings.max_body_bytes.get(),
            single_flight_refresh: settings.single_flight_refresh,
        }
    }
}

impl CacheConfig {
    pub fn fresh_ttl(&self) -> Duration {
        Duration::from_secs(self.fresh_ttl_seconds)
    }

    pub fn stale_ttl(&self) -> Duration {
        Duration::from_secs(self.stale_ttl_seconds)
    }

    /// Returns the store capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn store_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.store_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}
