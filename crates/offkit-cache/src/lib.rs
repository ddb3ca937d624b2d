//! # OffKit Cache
//!
//! Versioned request/response cache store for the OffKit offline worker.
//!
//! ## Features
//!
//! - **Cache**: URL-keyed response snapshots, `match`/`put`/`delete`/`keys`
//! - **CacheStorage**: named caches, one per deployed version
//! - **Version naming**: `<prefix>-v<version>`, with prefix-scoped GC
//! - **Write policy**: only status-200 snapshots are admitted
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage
//!     ├── "site-v1" (stale, removed at activate)
//!     └── "site-v2" (current)
//!             └── normalized URL → CacheEntry
//! ```
//!
//! The store is pure data. Callers that share it across tasks wrap it in
//! `Arc<RwLock<CacheStorage>>` and keep each lock scope to a single
//! operation, so entry operations stay independently atomic.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;
use url::Url;

// ==================== Errors ====================

/// Errors that can occur in cache store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Uncacheable status: {0}")]
    UncacheableStatus(u16),

    #[error("Cache not found: {0}")]
    NotFound(String),
}

// ==================== Version & naming ====================

/// Opaque version tag, one per deploy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheVersion(String);

impl CacheVersion {
    /// Create a version tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The raw tag.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheVersion {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// Compose the cache name for a subsystem prefix and version.
pub fn cache_name(prefix: &str, version: &CacheVersion) -> String {
    format!("{}-v{}", prefix, version)
}

/// Whether a cache name belongs to the subsystem with the given prefix.
pub fn shares_prefix(name: &str, prefix: &str) -> bool {
    name.len() > prefix.len() + 1 && name.starts_with(prefix) && name.as_bytes()[prefix.len()] == b'-'
}

/// Normalize a request URL into a cache key. Fragments never reach the
/// server, so they are stripped; queries are version-significant and kept.
pub fn normalize_key(url: &Url) -> String {
    let mut key = url.clone();
    key.set_fragment(None);
    key.into()
}

// ==================== Entry ====================

/// A cached response snapshot, keyed by normalized request URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Normalized request URL.
    pub url: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// When the snapshot was stored (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Create an entry stamped with the current time.
    pub fn new(
        url: &Url,
        status: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            url: normalize_key(url),
            status,
            headers,
            body,
            cached_at: now_ms(),
        }
    }

    /// Whether the store admits this entry.
    pub fn is_cacheable(&self) -> bool {
        self.status == 200
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ==================== Cache ====================

/// A single named cache of response snapshots.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    name: String,
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create an empty cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a snapshot by request URL.
    pub fn match_url(&self, url: &Url) -> Option<&CacheEntry> {
        self.entries.get(&normalize_key(url))
    }

    /// Look up a snapshot by an already-normalized key.
    pub fn match_key(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store a snapshot. Only status-200 entries are admitted; anything else
    /// is rejected so partial or error responses never shadow a good copy.
    pub fn put(&mut self, entry: CacheEntry) -> Result<(), CacheError> {
        if !entry.is_cacheable() {
            return Err(CacheError::UncacheableStatus(entry.status));
        }
        self.entries.insert(entry.url.clone(), entry);
        Ok(())
    }

    /// Remove a snapshot. Returns whether one existed.
    pub fn delete(&mut self, url: &Url) -> bool {
        self.entries.remove(&normalize_key(url)).is_some()
    }

    /// All stored keys.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|k| k.as_str()).collect()
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache storage ====================

/// The set of named caches, one per deployed version.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache, creating it if absent. Idempotent: re-opening the same
    /// name returns the existing cache.
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Borrow a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Mutably borrow a cache without creating it.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Cache> {
        self.caches.get_mut(name)
    }

    /// Whether a cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache wholesale. Returns whether one existed.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// All cache names.
    pub fn keys(&self) -> Vec<&str> {
        self.caches.keys().map(|k| k.as_str()).collect()
    }

    /// Delete every cache that shares `prefix` but is not `keep`. Returns the
    /// removed names so the caller can decide what to log.
    pub fn remove_stale_versions(&mut self, prefix: &str, keep: &str) -> Vec<String> {
        let stale: Vec<String> = self
            .caches
            .keys()
            .filter(|name| shares_prefix(name, prefix) && name.as_str() != keep)
            .cloned()
            .collect();

        for name in &stale {
            self.caches.remove(name);
            debug!(cache = %name, "removed stale cache version");
        }
        stale
    }
}
