//! Fault-injecting cache wrapper for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::{CacheEntry, CacheStore, StorageError};

/// Delegates to an inner cache but fails reads or writes for selected ids.
#[derive(Clone)]
pub struct FailingCache {
    inner: Arc<dyn CacheStore>,
    failing_writes: Arc<Mutex<HashSet<String>>>,
    failing_reads: Arc<Mutex<HashSet<String>>>,
}

impl FailingCache {
    pub fn new(inner: Arc<dyn CacheStore>) -> Self {
        Self {
            inner,
            failing_writes: Arc::default(),
            failing_reads: Arc::default(),
        }
    }

    pub fn fail_writes_for(&self, id: impl Into<String>) {
        self.failing_writes.lock().insert(id.into());
    }

    pub fn fail_reads_for(&self, id: impl Into<String>) {
        self.failing_reads.lock().insert(id.into());
    }

    pub fn heal(&self, id: &str) {
        self.failing_writes.lock().remove(id);
        self.failing_reads.lock().remove(id);
    }
}

#[async_trait]
impl CacheStore for FailingCache {
    async fn put(
        &self,
        id: &str,
        data: Value,
        timestamp: Option<u64>,
    ) -> Result<CacheEntry, StorageError> {
        if self.failing_writes.lock().contains(id) {
            return Err(StorageError::Unavailable(format!("injected write failure for {id}")));
        }
        self.inner.put(id, data, timestamp).await
    }

    async fn get(&self, id: &str) -> Result<Option<CacheEntry>, StorageError> {
        if self.failing_reads.lock().contains(id) {
            return Err(StorageError::Unavailable(format!("injected read failure for {id}")));
        }
        self.inner.get(id).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        self.inner.delete(id).await
    }

    async fn list(
        &self,
        prefix: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>, StorageError> {
        self.inner.list(prefix, limit).await
    }
}
