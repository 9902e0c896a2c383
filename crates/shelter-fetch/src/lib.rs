//! Shelter Network Fetch
//!
//! This crate provides the network primitive the cache manager falls back
//! to: request/response types and an HTTP client for the serving origin.

pub mod client;
pub mod error;
pub mod types;

pub use client::{Fetcher, HttpFetcher, HttpFetcherConfig, is_hop_by_hop, strip_hop_by_hop};
pub use error::FetchError;
pub use types::{FetchRequest, FetchResponse, ResponseType};
