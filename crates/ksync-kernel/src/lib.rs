//! Local durable cache for the sync kernel.
//!
//! The cache is a plain key/value surface: entries are opaque JSON values
//! stamped with a timestamp. It never arbitrates between writers; ordering and
//! last-write-wins decisions belong to the sync manager.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod error;
mod memory;
mod sqlite;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::StorageError;
pub use memory::MemoryCache;
pub use sqlite::{SqliteCache, DEFAULT_CACHE_FILE};

/// A single cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub data: Value,
    pub timestamp: u64,
}

impl CacheEntry {
    /// Build an entry, stamping it with the current time when `timestamp` is omitted.
    pub fn new(id: impl Into<String>, data: Value, timestamp: Option<u64>) -> Self {
        Self {
            id: id.into(),
            data,
            timestamp: timestamp.unwrap_or_else(now_ms),
        }
    }
}

/// Storage contract shared by the sync manager and reactive stores.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Write `data` under `id`, replacing any previous entry.
    async fn put(
        &self,
        id: &str,
        data: Value,
        timestamp: Option<u64>,
    ) -> Result<CacheEntry, StorageError>;

    async fn get(&self, id: &str) -> Result<Option<CacheEntry>, StorageError>;

    /// Remove `id`; returns whether an entry existed.
    async fn delete(&self, id: &str) -> Result<bool, StorageError>;

    /// Entries ordered by id, optionally restricted to an id prefix.
    async fn list(&self, prefix: Option<&str>, limit: usize)
        -> Result<Vec<CacheEntry>, StorageError>;
}

pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(feature = "metrics")]
pub(crate) fn record_write(ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    metrics::counter!("ksync_cache_writes_total", "outcome" => outcome).increment(1);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_write(_ok: bool) {}
