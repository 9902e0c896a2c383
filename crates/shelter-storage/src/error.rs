//! Storage error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache not found: {0}")]
    NotFound(String),

    #[error("Quota exceeded: {requested} bytes requested, {available} bytes available")]
    QuotaExceeded { requested: u64, available: u64 },

    #[error("Corrupt entry: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether the failure was caused by running out of storage space
    pub fn is_quota(&self) -> bool {
        match self {
            StorageError::QuotaExceeded { .. } => true,
            StorageError::Io(e) => e.kind() == std::io::ErrorKind::StorageFull,
            _ => false,
        }
    }
}
