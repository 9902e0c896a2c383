//! Cache storage trait

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::StorageError;

/// Handle to an opened named cache
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheHandle {
    name: String,
}

impl CacheHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A response as it is kept inside a cache
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
    pub status: u16,
    /// Response type as reported by the fetch layer ("basic", "cors", ...)
    pub response_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub stored_at: DateTime<Utc>,
}

impl StoredResponse {
    /// Size accounted against storage quota
    pub fn size(&self) -> u64 {
        let header_bytes: usize = self.headers.iter().map(|(k, v)| k.len() + v.len()).sum();
        (self.body.len() + header_bytes) as u64
    }
}

/// Storage backend trait
///
/// A storage holds any number of named caches, each mapping an absolute
/// request URL to one stored response. Names are opaque strings and may
/// belong to other consumers sharing the same storage.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a cache, creating it if it does not exist
    async fn open(&self, name: &str) -> Result<CacheHandle, StorageError>;

    /// Look up the response stored for a URL
    async fn match_url(
        &self,
        cache: &CacheHandle,
        url: &str,
    ) -> Result<Option<StoredResponse>, StorageError>;

    /// Store a response for a URL, replacing any previous entry
    async fn put(
        &self,
        cache: &CacheHandle,
        url: &str,
        response: StoredResponse,
    ) -> Result<(), StorageError>;

    /// List the request URLs stored in a cache
    async fn entries(&self, cache: &CacheHandle) -> Result<Vec<String>, StorageError>;

    /// List the names of every cache in this storage
    async fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Delete a cache; returns false if it did not exist
    async fn delete(&self, name: &str) -> Result<bool, StorageError>;
}

/// Compute the hex SHA256 of a key, used for file names
pub fn compute_sha256(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
