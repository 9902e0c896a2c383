//! Shelter Core Business Logic
//!
//! This crate provides the runtime cache manager: versioned cache naming,
//! admission control, generation cleanup, precaching and the per-request
//! fetch interceptor.

pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod interceptor;
pub mod naming;
pub mod worker;

#[cfg(test)]
mod testing;

pub use cache::{
    AdmissionPolicy, CleanupReport, GenerationManager, Precacher, SkipReason,
};
pub use config::{AdmissionConfig, WorkerConfig, validate_manifest, validate_namespace};
pub use error::CoreError;
pub use interceptor::{CacheStats, FetchInterceptor};
pub use naming::{CacheNamer, Generation};
pub use worker::{CacheWorker, WorkerState};
