//! In-memory storage backend

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

use crate::backend::{CacheHandle, CacheStorage, StoredResponse};
use crate::error::StorageError;

type Entries = BTreeMap<String, StoredResponse>;

/// In-memory storage backend
///
/// Holds every cache in a single map. An optional quota bounds the total
/// size of all stored responses across caches.
#[derive(Default)]
pub struct MemoryStorage {
    caches: RwLock<BTreeMap<String, Entries>>,
    quota: Option<u64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a storage that rejects writes beyond `quota` bytes
    pub fn with_quota(quota: u64) -> Self {
        Self {
            caches: RwLock::new(BTreeMap::new()),
            quota: Some(quota),
        }
    }

    /// Total bytes currently accounted against the quota
    pub fn used_bytes(&self) -> u64 {
        self.caches
            .read()
            .values()
            .flat_map(|entries| entries.values())
            .map(StoredResponse::size)
            .sum()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn open(&self, name: &str) -> Result<CacheHandle, StorageError> {
        let mut caches = self.caches.write();
        if !caches.contains_key(name) {
            debug!("Creating cache {}", name);
            caches.insert(name.to_string(), Entries::new());
        }
        Ok(CacheHandle::new(name))
    }

    async fn match_url(
        &self,
        cache: &CacheHandle,
        url: &str,
    ) -> Result<Option<StoredResponse>, StorageError> {
        Ok(self
            .caches
            .read()
            .get(cache.name())
            .and_then(|entries| entries.get(url))
            .cloned())
    }

    async fn put(
        &self,
        cache: &CacheHandle,
        url: &str,
        response: StoredResponse,
    ) -> Result<(), StorageError> {
        // Quota check and insert happen under one lock so a rejected write
        // never leaves a partial entry behind.
        let mut caches = self.caches.write();

        if let Some(quota) = self.quota {
            let used: u64 = caches
                .values()
                .flat_map(|entries| entries.values())
                .map(StoredResponse::size)
                .sum();
            let replaced = caches
                .get(cache.name())
                .and_then(|entries| entries.get(url))
                .map(StoredResponse::size)
                .unwrap_or(0);
            let available = quota.saturating_sub(used - replaced);
            let requested = response.size();
            if requested > available {
                return Err(StorageError::QuotaExceeded {
                    requested,
                    available,
                });
            }
        }

        let entries = caches
            .get_mut(cache.name())
            .ok_or_else(|| StorageError::NotFound(cache.name().to_string()))?;
        entries.insert(url.to_string(), response);
        Ok(())
    }

    async fn entries(&self, cache: &CacheHandle) -> Result<Vec<String>, StorageError> {
        self.caches
            .read()
            .get(cache.name())
            .map(|entries| entries.keys().cloned().collect())
            .ok_or_else(|| StorageError::NotFound(cache.name().to_string()))
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.caches.read().keys().cloned().collect())
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        debug!("Deleting cache {}", name);
        Ok(self.caches.write().remove(name).is_some())
    }
}
