//! Key-value store contract and the in-memory adapter.
//!
//! The engine only needs three operations from a store: a lookup returning the
//! value together with its metadata, a put with a per-key TTL, and a delete.
//! Stores may be remote and eventually consistent; the engine never relies on
//! read-your-writes.

use std::{sync::RwLock, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use thiserror::Error;
use tokio::time::Instant;

use super::config::CacheConfig;
use super::lock::{rw_read, rw_write};
use super::metadata::EntryMetadata;

const SOURCE: &str = "cache::store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode metadata for `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("ttl of {ttl:?} for `{key}` is out of range")]
    TtlOutOfRange { key: String, ttl: Duration },
    #[error("failed to decode metadata for `{key}`: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// Raw lookup result. Either half may be missing in an eventually consistent store.
#[derive(Debug, Clone, Default)]
pub struct KvRecord {
    pub value: Option<Bytes>,
    pub metadata: Option<EntryMetadata>,
}

impl KvRecord {
    pub fn missing() -> Self {
        Self::default()
    }

    /// A record is usable only when both the value and its metadata are present.
    pub fn into_entry(self) -> Option<StoredEntry> {
        match (self.value, self.metadata) {
            (Some(value), Some(metadata)) => Some(StoredEntry { value, metadata }),
            _ => None,
        }
    }
}

/// A complete cache entry: body bytes plus the headers to replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub value: Bytes,
    pub metadata: EntryMetadata,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_with_metadata(&self, key: &str) -> Result<KvRecord, StoreError>;

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        metadata: &EntryMetadata,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

struct MemoryRecord {
    value: Bytes,
    metadata: Vec<u8>,
    expires_at: Instant,
}

/// In-process store with per-key TTL and LRU eviction.
///
/// Metadata is kept in its wire encoding so the adapter behaves like a remote
/// store: whatever cannot survive the codec cannot be cached.
pub struct MemoryKvStore {
    entries: RwLock<LruCache<String, MemoryRecord>>,
}

impl MemoryKvStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.store_capacity_non_zero())),
        }
    }

    /// Number of keys currently held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "purge_expired");
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, record)| record.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get_with_metadata(&self, key: &str) -> Result<KvRecord, StoreError> {
        let now = Instant::now();
        let (value, encoded) = {
            let mut entries = rw_write(&self.entries, SOURCE, "get_with_metadata");
            let found = entries.get(key).map(|record| {
                (
                    record.expires_at > now,
                    record.value.clone(),
                    record.metadata.clone(),
                )
            });
            match found {
                Some((true, value, encoded)) => (value, encoded),
                Some((false, _, _)) => {
                    entries.pop(key);
                    return Ok(KvRecord::missing());
                }
                None => return Ok(KvRecord::missing()),
            }
        };

        let metadata = EntryMetadata::decode(&encoded).map_err(|source| StoreError::Decode {
            key: key.to_string(),
            source,
        })?;

        Ok(KvRecord {
            value: Some(value),
            metadata: Some(metadata),
        })
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        metadata: &EntryMetadata,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let encoded = metadata.encode().map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        let expires_at = Instant::now()
            .checked_add(ttl)
            .ok_or_else(|| StoreError::TtlOutOfRange {
                key: key.to_string(),
                ttl,
            })?;
        let record = MemoryRecord {
            value,
            metadata: encoded,
            expires_at,
        };

        let evicted = rw_write(&self.entries, SOURCE, "put").push(key.to_string(), record);
        if let Some((evicted_key, _)) = evicted
            && evicted_key != key
        {
            metrics::counter!("dyncache_store_evict_total").increment(1);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        rw_write(&self.entries, SOURCE, "delete").pop(key);
        Ok(())
    }
}
