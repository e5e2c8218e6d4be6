//! Content-addressed result cache.
//!
//! Results are keyed by a digest of the job identity, its freshness marker and
//! its sorted parameters, so identical work is only ever executed once.
//! Values are stored JSON-encoded behind the [`CacheStore`] trait; an entry
//! that no longer decodes is treated as a miss and dropped.

mod memory;
mod sqlite;

pub use memory::MemoryCacheStore;
pub use sqlite::SqliteCacheStore;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{CacheBackend, CacheConfig};
use crate::job::Job;
use crate::metrics;

/// Errors from cache stores.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Deterministic digest identifying a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derives the key for a job.
    ///
    /// Each field is length-prefixed so that no two distinct jobs can
    /// produce the same byte stream.
    pub fn for_job(job: &Job) -> Self {
        let mut hasher = Sha256::new();
        feed(&mut hasher, job.id.as_bytes());
        match &job.modified {
            Some(marker) => {
                hasher.update([1u8]);
                feed(&mut hasher, marker.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update((job.params.len() as u64).to_le_bytes());
        for (key, value) in &job.params {
            feed(&mut hasher, key.as_bytes());
            feed(&mut hasher, value.as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn feed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A raw entry as held by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// JSON-encoded value.
    pub value: String,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

/// A decoded cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub key: CacheKey,
    pub value: V,
    pub created_at: DateTime<Utc>,
}

/// Bounds applied by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Maximum number of entries kept; the least recently used are evicted.
    pub max_entries: usize,
    /// Entries older than this read as misses.
    pub ttl: Option<Duration>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: None,
        }
    }
}

impl CachePolicy {
    pub(crate) fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => match chrono::Duration::from_std(ttl) {
                Ok(ttl) => created_at + ttl <= now,
                Err(_) => false,
            },
            None => false,
        }
    }
}

impl From<&CacheConfig> for CachePolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            max_entries: config.max_entries,
            ttl: config.ttl_secs.map(Duration::from_secs),
        }
    }
}

/// Key/value storage behind a [`ContentCache`].
pub trait CacheStore: Send + Sync {
    /// Returns the entry for a key, or `None` if absent or expired.
    fn get(&self, key: &str) -> Result<Option<StoredEntry>, CacheError>;

    /// Writes an entry, replacing any previous one.
    fn put(&self, key: &str, entry: StoredEntry) -> Result<(), CacheError>;

    /// Removes an entry. Returns whether it existed.
    fn remove(&self, key: &str) -> Result<bool, CacheError>;

    /// Drops all entries.
    fn clear(&self) -> Result<(), CacheError>;

    /// Number of entries currently stored.
    fn len(&self) -> Result<usize, CacheError>;
}

/// Typed cache of job outputs.
pub struct ContentCache<V> {
    store: Box<dyn CacheStore>,
    _value: PhantomData<fn() -> V>,
}

impl<V> ContentCache<V>
where
    V: Serialize + DeserializeOwned,
{
    /// Creates a cache over the given store.
    pub fn new(store: impl CacheStore + 'static) -> Self {
        Self {
            store: Box::new(store),
            _value: PhantomData,
        }
    }

    /// An unbounded-TTL in-memory cache with the given capacity.
    pub fn in_memory(max_entries: usize) -> Self {
        Self::new(MemoryCacheStore::new(CachePolicy {
            max_entries,
            ttl: None,
        }))
    }

    /// Builds the cache selected by configuration.
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        let policy = CachePolicy::from(config);
        match config.backend {
            CacheBackend::Memory => Ok(Self::new(MemoryCacheStore::new(policy))),
            CacheBackend::Sqlite => Ok(Self::new(SqliteCacheStore::new(&config.path, policy)?)),
        }
    }

    /// Derives the key for a job.
    pub fn key_for(&self, job: &Job) -> CacheKey {
        CacheKey::for_job(job)
    }

    /// Looks up a value.
    ///
    /// Store errors and undecodable entries are reported as misses.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.entry(key).map(|entry| entry.value)
    }

    /// Looks up a full entry.
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let stored = match self.store.get(key.as_str()) {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                metrics::CACHE_LOOKUPS.with_label_values(&["miss"]).inc();
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed, treating as miss");
                metrics::CACHE_LOOKUPS.with_label_values(&["error"]).inc();
                return None;
            }
        };

        match serde_json::from_str::<V>(&stored.value) {
            Ok(value) => {
                metrics::CACHE_LOOKUPS.with_label_values(&["hit"]).inc();
                Some(CacheEntry {
                    key: key.clone(),
                    value,
                    created_at: stored.created_at,
                })
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding corrupt cache entry");
                metrics::CACHE_LOOKUPS.with_label_values(&["corrupt"]).inc();
                if let Err(e) = self.store.remove(key.as_str()) {
                    debug!(key = %key, error = %e, "Failed to remove corrupt cache entry");
                }
                None
            }
        }
    }

    /// Stores a value, overwriting any previous entry.
    pub fn put(&self, key: &CacheKey, value: &V) -> Result<(), CacheError> {
        let entry = StoredEntry {
            value: serde_json::to_string(value)?,
            created_at: Utc::now(),
        };
        self.store.put(key.as_str(), entry)
    }

    /// Drops all entries.
    pub fn clear(&self) -> Result<(), CacheError> {
        self.store.clear()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.store.len().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
