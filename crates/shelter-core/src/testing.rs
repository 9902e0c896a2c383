//! Test doubles shared by unit tests

use async_trait::async_trait;
use http::StatusCode;
use parking_lot::Mutex;
use shelter_fetch::{FetchError, FetchRequest, FetchResponse, Fetcher};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-process network with canned responses
///
/// Unknown URLs answer 404. Every request is recorded.
#[derive(Default)]
pub struct FakeFetcher {
    routes: Mutex<HashMap<String, FetchResponse>>,
    calls: Mutex<Vec<String>>,
    offline: AtomicBool,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, url: &str, response: FetchResponse) {
        self.routes.lock().insert(url.to_string(), response);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.calls.lock().iter().filter(|u| u.as_str() == url).count()
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Unavailable(request.url.clone()));
        }
        self.calls.lock().push(request.url.clone());

        let response = self.routes.lock().get(&request.url).cloned();
        Ok(response.unwrap_or_else(|| FetchResponse::new(StatusCode::NOT_FOUND, "not found")))
    }
}
