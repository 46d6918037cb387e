use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{record_write, CacheEntry, CacheStore, StorageError};

/// In-process cache for tests and ephemeral kernels. Clones share storage.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<RwLock<BTreeMap<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn put(
        &self,
        id: &str,
        data: Value,
        timestamp: Option<u64>,
    ) -> Result<CacheEntry, StorageError> {
        let entry = CacheEntry::new(id, data, timestamp);
        self.entries.write().insert(id.to_string(), entry.clone());
        record_write(true);
        Ok(entry)
    }

    async fn get(&self, id: &str) -> Result<Option<CacheEntry>, StorageError> {
        Ok(self.entries.read().get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.entries.write().remove(id).is_some())
    }

    async fn list(
        &self,
        prefix: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>, StorageError> {
        let guard = self.entries.read();
        Ok(guard
            .values()
            .filter(|e| prefix.map(|p| e.id.starts_with(p)).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect())
    }
}
