//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] shelter_storage::StorageError),

    #[error("Network error: {0}")]
    Network(#[from] shelter_fetch::FetchError),

    #[error("Failed to precache {url}: {reason}")]
    ManifestFetch { url: String, reason: String },

    #[error("Malformed URL: {0}")]
    MalformedUrl(String),

    #[error("Response cannot be stored: {0}")]
    Unstorable(String),

    #[error("Corrupt cache entry: {0}")]
    CorruptEntry(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid lifecycle state: {0}")]
    InvalidState(String),
}
