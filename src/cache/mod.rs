//! Stale-while-revalidate response cache.
//!
//! A resource is kept under two store keys:
//!
//! - **fresh** (`"fresh: " + url`): short TTL, served without further work;
//! - **stale** (`"stale: " + url`): long TTL, served while a background
//!   refresh rewrites both keys.
//!
//! ## Configuration
//!
//! Lifetimes and store sizing are read from the `[cache]` table:
//!
//! ```toml
//! [cache]
//! fresh_ttl_seconds = 60
//! stale_ttl_seconds = 3600
//! store_capacity = 1024
//! # ... see config.rs for all options
//! ```

pub(crate) mod config;
mod engine;
mod keys;
mod lock;
mod metadata;
mod origin;
mod scheduler;
mod store;

pub use config::CacheConfig;
pub use engine::{
    CacheEngine, Invalidation, RefreshError, RefreshOutcome, Resolution, ResolveSource, X_CACHE,
};
pub use keys::{EntryTier, FRESH_PREFIX, ResourceKey, STALE_PREFIX};
pub use metadata::{EntryMetadata, is_hop_by_hop};
pub use origin::{
    BufferedBody, FetchedResponse, OriginError, OriginFetcher, OriginResponse, buffer_body,
    is_storable, timed_fetch,
};
pub use scheduler::RefreshScheduler;
pub use store::{KvRecord, KvStore, MemoryKvStore, StoreError, StoredEntry};
