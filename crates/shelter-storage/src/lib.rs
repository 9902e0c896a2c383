//! Shelter Storage Layer
//!
//! This crate provides the named-cache abstraction the offline cache
//! manager writes into, with in-memory and local disk backends.

pub mod backend;
pub mod error;
pub mod local;
pub mod memory;

pub use backend::{CacheHandle, CacheStorage, StoredResponse};
pub use error::StorageError;
pub use local::LocalStorage;
pub use memory::MemoryStorage;
