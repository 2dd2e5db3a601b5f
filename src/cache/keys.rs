//! Cache key definitions.
//!
//! Every resource is stored under two keys, one per tier, derived from its
//! canonical origin URL.

use std::fmt;

use url::Url;

pub const FRESH_PREFIX: &str = "fresh: ";
pub const STALE_PREFIX: &str = "stale: ";

/// Storage tier of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryTier {
    /// Short-lived copy, served without any background action.
    Fresh,
    /// Long-lived copy, served while a refresh runs in the background.
    Stale,
}

impl EntryTier {
    pub fn prefix(self) -> &'static str {
        match self {
            EntryTier::Fresh => FRESH_PREFIX,
            EntryTier::Stale => STALE_PREFIX,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryTier::Fresh => "fresh",
            EntryTier::Stale => "stale",
        }
    }
}

/// A cached resource, identified by its canonical origin URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    url: Url,
}

impl ResourceKey {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Store key for the given tier: prefix followed by the full URL string.
    pub fn entry_key(&self, tier: EntryTier) -> String {
        format!("{}{}", tier.prefix(), self.url.as_str())
    }

    pub fn fresh_key(&self) -> String {
        self.entry_key(EntryTier::Fresh)
    }

    pub fn stale_key(&self) -> String {
        self.entry_key(EntryTier::Stale)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}
