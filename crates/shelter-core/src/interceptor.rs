//! Per-request fetch interception

use http::Method;
use parking_lot::Mutex;
use serde::Serialize;
use shelter_fetch::{FetchRequest, FetchResponse, Fetcher};
use shelter_storage::{CacheHandle, CacheStorage, StorageError, StoredResponse};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::AdmissionPolicy;
use crate::entry::{from_stored, to_stored};
use crate::error::CoreError;
use crate::naming::CacheNamer;

/// Counters describing how requests were served
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Requests answered from a cache
    pub hits: u64,
    /// Admitted requests that had to go to the network
    pub misses: u64,
    /// Requests that never consulted the cache
    pub passthrough: u64,
    /// Network responses refused by admission control
    pub skipped: u64,
    /// Responses written to the runtime generation
    pub stored: u64,
    /// Writes that failed (quota, I/O)
    pub store_failures: u64,
    /// Requests that failed on the network
    pub network_errors: u64,
}

/// Cache-first request handling with write-through to the runtime generation
///
/// Requests refused by admission control before any response exists go
/// straight to the network. Everything else is answered from the cache when
/// possible; otherwise the network response is returned and, if admitted,
/// copied into the runtime generation by a detached task.
pub struct FetchInterceptor {
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    policy: Arc<AdmissionPolicy>,
    namer: CacheNamer,
    /// Absolute URLs of precached resources
    manifest: HashSet<String>,
    /// Runtime generation, opened by the first admitted response
    runtime: OnceCell<CacheHandle>,
    stats: Arc<RwLock<CacheStats>>,
    pending: Mutex<JoinSet<()>>,
}

impl FetchInterceptor {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        policy: Arc<AdmissionPolicy>,
        namer: CacheNamer,
        manifest_urls: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            storage,
            fetcher,
            policy,
            namer,
            manifest: manifest_urls.into_iter().collect(),
            runtime: OnceCell::new(),
            stats: Arc::new(RwLock::new(CacheStats::default())),
            pending: Mutex::new(JoinSet::new()),
        }
    }

    /// Get interception statistics
    pub async fn stats(&self) -> CacheStats {
        self.stats.read().await.clone()
    }

    /// Handle an intercepted request
    ///
    /// Network failures are returned to the caller. Cache failures never
    /// are: a broken lookup counts as a miss and a broken write is logged.
    pub async fn handle(&self, request: &FetchRequest) -> Result<FetchResponse, CoreError> {
        if request.method != Method::GET {
            debug!("{} {}: not cacheable, network only", request.method, request.url);
            return self.passthrough(request).await;
        }

        if let Some(reason) = self.policy.skip_reason(request, None) {
            debug!("{}: {}, network only", request.url, reason);
            return self.passthrough(request).await;
        }

        let key = self.cache_key(request)?;

        if let Some(response) = self.lookup(&key).await {
            debug!("Cache hit: {}", key);
            self.stats.write().await.hits += 1;
            return Ok(response);
        }

        debug!("Cache miss: {}", key);
        self.stats.write().await.misses += 1;

        let response = self.fetch(request).await?;

        if let Some(reason) = self.policy.skip_reason(request, Some(&response)) {
            debug!("{}: {}, not stored", key, reason);
            self.stats.write().await.skipped += 1;
            return Ok(response);
        }

        let stored = match to_stored(&response) {
            Ok(stored) => stored,
            Err(e) => {
                debug!("{}: {}, not stored", key, e);
                self.stats.write().await.skipped += 1;
                return Ok(response);
            }
        };

        match self.runtime_cache().await {
            Ok(cache) => self.spawn_store(cache, key, stored),
            Err(e) => {
                warn!("Failed to open {}: {}", self.namer.runtime_cache_id(), e);
                self.stats.write().await.store_failures += 1;
            }
        }
        Ok(response)
    }

    /// Forward a request to the network without touching any cache
    pub async fn passthrough(&self, request: &FetchRequest) -> Result<FetchResponse, CoreError> {
        self.stats.write().await.passthrough += 1;
        self.fetch(request).await
    }

    /// Wait for every detached cache write to finish
    pub async fn flush(&self) {
        let mut pending = std::mem::take(&mut *self.pending.lock());
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                warn!("Cache write task failed: {}", e);
            }
        }
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, CoreError> {
        match self.fetcher.fetch(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.stats.write().await.network_errors += 1;
                Err(CoreError::Network(e))
            }
        }
    }

    /// Cache key for a request: its absolute URL without fragment
    fn cache_key(&self, request: &FetchRequest) -> Result<String, CoreError> {
        let mut url = request
            .parsed_url()
            .ok_or_else(|| CoreError::MalformedUrl(request.url.clone()))?;
        url.set_fragment(None);
        Ok(url.to_string())
    }

    /// Generations to consult for a key, in order
    fn candidate_caches(&self, key: &str) -> Vec<String> {
        if self.manifest.contains(key) || self.policy.is_cacheable_asset(key) {
            vec![self.namer.static_cache_id(), self.namer.runtime_cache_id()]
        } else {
            vec![self.namer.runtime_cache_id()]
        }
    }

    async fn lookup(&self, key: &str) -> Option<FetchResponse> {
        for name in self.candidate_caches(key) {
            // Lookups must not create the runtime generation, so the
            // handle is built directly instead of opened.
            let cache = CacheHandle::new(name);
            match self.storage.match_url(&cache, key).await {
                Ok(Some(stored)) => match from_stored(stored) {
                    Ok(response) => return Some(response),
                    Err(e) => warn!("Ignoring cached entry for {} in {}: {}", key, cache.name(), e),
                },
                Ok(None) => {}
                Err(e) => warn!("Cache lookup for {} in {} failed: {}", key, cache.name(), e),
            }
        }
        None
    }

    /// The runtime generation handle
    ///
    /// Opened at most once. Once a newer version has deleted the
    /// generation, writes through this handle fail with `NotFound` instead
    /// of creating it again.
    async fn runtime_cache(&self) -> Result<CacheHandle, StorageError> {
        let cache_id = self.namer.runtime_cache_id();
        self.runtime
            .get_or_try_init(|| async { self.storage.open(&cache_id).await })
            .await
            .cloned()
    }

    /// Write a response copy to the runtime generation without blocking the caller
    fn spawn_store(&self, cache: CacheHandle, key: String, stored: StoredResponse) {
        let storage = self.storage.clone();
        let stats = self.stats.clone();

        let mut pending = self.pending.lock();
        while pending.try_join_next().is_some() {}

        pending.spawn(async move {
            match storage.put(&cache, &key, stored).await {
                Ok(()) => {
                    debug!("Stored {} in {}", key, cache.name());
                    stats.write().await.stored += 1;
                }
                Err(e) => {
                    if e.is_quota() {
                        warn!("Cache quota exhausted, not storing {}: {}", key, e);
                    } else if matches!(e, StorageError::NotFound(_)) {
                        warn!("{} was removed, not storing {}", cache.name(), key);
                    } else {
                        warn!("Failed to store {} in {}: {}", key, cache.name(), e);
                    }
                    stats.write().await.store_failures += 1;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdmissionConfig;
    use crate::testing::FakeFetcher;
    use http::StatusCode;
    use shelter_fetch::ResponseType;
    use shelter_storage::MemoryStorage;
    use url::Url;

    const ORIGIN: &str = "https://mood.test";

    struct Harness {
        storage: Arc<MemoryStorage>,
        fetcher: Arc<FakeFetcher>,
        interceptor: FetchInterceptor,
    }

    fn harness_with(storage: MemoryStorage, manifest: &[&str]) -> Harness {
        let storage = Arc::new(storage);
        let fetcher = Arc::new(FakeFetcher::new());
        let policy = AdmissionPolicy::new(Url::parse(ORIGIN).unwrap(), &AdmissionConfig::default());
        let interceptor = FetchInterceptor::new(
            storage.clone(),
            fetcher.clone(),
            Arc::new(policy),
            CacheNamer::new("mood", "1.0.1"),
            manifest.iter().map(|p| format!("{}{}", ORIGIN, p)),
        );
        Harness {
            storage,
            fetcher,
            interceptor,
        }
    }

    fn harness() -> Harness {
        harness_with(MemoryStorage::new(), &[])
    }

    fn url(path: &str) -> String {
        format!("{}{}", ORIGIN, path)
    }

    fn runtime() -> CacheHandle {
        CacheHandle::new("mood-runtime-1.0.1")
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let h = harness();
        h.fetcher.route(&url("/app.js"), FetchResponse::new(StatusCode::OK, "js"));

        let request = FetchRequest::get(url("/app.js"));
        let first = h.interceptor.handle(&request).await.unwrap();
        assert_eq!(&first.body[..], b"js");
        h.interceptor.flush().await;

        let second = h.interceptor.handle(&request).await.unwrap();
        assert_eq!(&second.body[..], b"js");
        assert_eq!(h.fetcher.call_count(&url("/app.js")), 1);

        let stats = h.interceptor.stats().await;
        assert_eq!((stats.hits, stats.misses, stats.stored), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_static_generation_is_served_for_manifest_urls() {
        let h = harness_with(MemoryStorage::new(), &["/"]);
        let cache = h.storage.open("mood-static-1.0.1").await.unwrap();
        let precached = FetchResponse::new(StatusCode::OK, "shell");
        h.storage.put(&cache, &url("/"), to_stored(&precached).unwrap()).await.unwrap();

        let response = h.interceptor.handle(&FetchRequest::get(url("/"))).await.unwrap();
        assert_eq!(&response.body[..], b"shell");
        assert!(h.fetcher.calls().is_empty());
        // A hit never creates the runtime generation
        assert_eq!(h.storage.keys().await.unwrap(), vec!["mood-static-1.0.1"]);
    }

    #[tokio::test]
    async fn test_fragment_is_ignored_for_cache_key() {
        let h = harness();
        h.fetcher.route(&url("/page.html"), FetchResponse::new(StatusCode::OK, "page"));
        let mut request = FetchRequest::get(url("/page.html"));
        h.interceptor.handle(&request).await.unwrap();
        h.interceptor.flush().await;

        request.url = url("/page.html#section-2");
        h.interceptor.handle(&request).await.unwrap();
        assert_eq!(h.fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_blacklisted_path_never_stored() {
        let h = harness();
        h.fetcher.route(&url("/api/mood"), FetchResponse::new(StatusCode::OK, "{\"mood\":3}"));

        let request = FetchRequest::get(url("/api/mood"));
        for _ in 0..2 {
            let response = h.interceptor.handle(&request).await.unwrap();
            assert_eq!(response.status, StatusCode::OK);
        }
        h.interceptor.flush().await;

        assert_eq!(h.fetcher.call_count(&url("/api/mood")), 2);
        assert!(h.storage.keys().await.unwrap().is_empty());
        assert_eq!(h.interceptor.stats().await.passthrough, 2);
    }

    #[tokio::test]
    async fn test_cross_origin_passthrough() {
        let h = harness();
        let cdn = "https://cdn.example/lib.js";
        h.fetcher.route(cdn, FetchResponse::new(StatusCode::OK, "lib").with_type(ResponseType::Cors));

        h.interceptor.handle(&FetchRequest::get(cdn)).await.unwrap();
        h.interceptor.handle(&FetchRequest::get(cdn)).await.unwrap();
        h.interceptor.flush().await;

        assert_eq!(h.fetcher.call_count(cdn), 2);
        assert!(h.storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_get_is_network_only() {
        let h = harness();
        h.fetcher.route(&url("/mood.json"), FetchResponse::new(StatusCode::OK, "{}"));

        let request = FetchRequest::new(Method::POST, url("/mood.json"));
        h.interceptor.handle(&request).await.unwrap();
        h.interceptor.flush().await;

        assert!(h.storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_responses_not_stored() {
        let h = harness();
        h.fetcher.route(
            &url("/profile.html"),
            FetchResponse::new(StatusCode::OK, "hi").with_header("set-cookie", "sid=1"),
        );
        h.fetcher.route(&url("/gone.css"), FetchResponse::new(StatusCode::GONE, ""));

        let response = h.interceptor.handle(&FetchRequest::get(url("/profile.html"))).await.unwrap();
        assert!(response.headers.contains_key("set-cookie"));
        let response = h.interceptor.handle(&FetchRequest::get(url("/gone.css"))).await.unwrap();
        assert_eq!(response.status, StatusCode::GONE);
        h.interceptor.flush().await;

        assert!(h.storage.keys().await.unwrap().is_empty());
        assert_eq!(h.interceptor.stats().await.skipped, 2);
    }

    #[tokio::test]
    async fn test_network_error_propagates() {
        let h = harness();
        h.fetcher.set_offline(true);

        let err = h.interceptor.handle(&FetchRequest::get(url("/app.js"))).await.unwrap_err();
        assert!(matches!(err, CoreError::Network(_)));
        assert_eq!(h.interceptor.stats().await.network_errors, 1);
    }

    #[tokio::test]
    async fn test_cached_response_survives_going_offline() {
        let h = harness();
        h.fetcher.route(&url("/app.js"), FetchResponse::new(StatusCode::OK, "js"));
        h.interceptor.handle(&FetchRequest::get(url("/app.js"))).await.unwrap();
        h.interceptor.flush().await;

        h.fetcher.set_offline(true);
        let response = h.interceptor.handle(&FetchRequest::get(url("/app.js"))).await.unwrap();
        assert_eq!(&response.body[..], b"js");
    }

    #[tokio::test]
    async fn test_store_failure_does_not_alter_response() {
        let h = harness_with(MemoryStorage::with_quota(4), &[]);
        h.fetcher.route(&url("/big.js"), FetchResponse::new(StatusCode::OK, "a large script"));

        let response = h.interceptor.handle(&FetchRequest::get(url("/big.js"))).await.unwrap();
        assert_eq!(&response.body[..], b"a large script");
        h.interceptor.flush().await;

        let stats = h.interceptor.stats().await;
        assert_eq!(stats.store_failures, 1);
        assert_eq!(stats.stored, 0);
        assert!(h.storage.entries(&runtime()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_entry_treated_as_miss() {
        let h = harness();
        let cache = h.storage.open("mood-runtime-1.0.1").await.unwrap();
        let mut stored = to_stored(&FetchResponse::new(StatusCode::OK, "old")).unwrap();
        stored.response_type = "???".to_string();
        h.storage.put(&cache, &url("/app.js"), stored).await.unwrap();
        h.fetcher.route(&url("/app.js"), FetchResponse::new(StatusCode::OK, "fresh"));

        let response = h.interceptor.handle(&FetchRequest::get(url("/app.js"))).await.unwrap();
        assert_eq!(&response.body[..], b"fresh");
        h.interceptor.flush().await;

        let repaired = h.storage.match_url(&runtime(), &url("/app.js")).await.unwrap().unwrap();
        assert_eq!(repaired.response_type, "basic");
    }

    #[tokio::test]
    async fn test_write_into_removed_generation_is_dropped() {
        let h = harness();
        h.fetcher.route(&url("/a.js"), FetchResponse::new(StatusCode::OK, "a"));
        h.fetcher.route(&url("/b.js"), FetchResponse::new(StatusCode::OK, "b"));

        h.interceptor.handle(&FetchRequest::get(url("/a.js"))).await.unwrap();
        h.interceptor.flush().await;

        // A newer version's activation removes this generation
        assert!(h.storage.delete("mood-runtime-1.0.1").await.unwrap());

        let response = h.interceptor.handle(&FetchRequest::get(url("/b.js"))).await.unwrap();
        assert_eq!(&response.body[..], b"b");
        h.interceptor.flush().await;

        assert!(h.storage.keys().await.unwrap().is_empty());
        let stats = h.interceptor.stats().await;
        assert_eq!((stats.stored, stats.store_failures), (1, 1));
    }

    #[tokio::test]
    async fn test_range_request_does_not_poison_full_response() {
        let h = harness();
        h.fetcher.route(
            &url("/clip.webp"),
            FetchResponse::new(StatusCode::PARTIAL_CONTENT, "part"),
        );

        let mut ranged = FetchRequest::get(url("/clip.webp"));
        ranged
            .headers
            .insert(http::header::RANGE, http::HeaderValue::from_static("bytes=0-3"));
        let response = h.interceptor.handle(&ranged).await.unwrap();
        assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
        h.interceptor.flush().await;
        assert!(h.storage.keys().await.unwrap().is_empty());

        h.fetcher.route(&url("/clip.webp"), FetchResponse::new(StatusCode::OK, "full clip"));
        let response = h.interceptor.handle(&FetchRequest::get(url("/clip.webp"))).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"full clip");
    }

    #[tokio::test]
    async fn test_unsolicited_partial_content_not_stored() {
        let h = harness();
        h.fetcher.route(
            &url("/clip.webp"),
            FetchResponse::new(StatusCode::PARTIAL_CONTENT, "part"),
        );

        h.interceptor.handle(&FetchRequest::get(url("/clip.webp"))).await.unwrap();
        h.interceptor.flush().await;

        assert!(h.storage.keys().await.unwrap().is_empty());
        assert_eq!(h.interceptor.stats().await.skipped, 1);
    }

    #[tokio::test]
    async fn test_credentialed_response_not_shared() {
        let h = harness();
        h.fetcher.route(&url("/me.html"), FetchResponse::new(StatusCode::OK, "hello alice"));

        let mut signed_in = FetchRequest::get(url("/me.html"));
        signed_in
            .headers
            .insert(http::header::COOKIE, http::HeaderValue::from_static("sid=alice"));
        let response = h.interceptor.handle(&signed_in).await.unwrap();
        assert_eq!(&response.body[..], b"hello alice");
        h.interceptor.flush().await;
        assert!(h.storage.keys().await.unwrap().is_empty());

        h.fetcher.route(&url("/me.html"), FetchResponse::new(StatusCode::OK, "please sign in"));
        let response = h.interceptor.handle(&FetchRequest::get(url("/me.html"))).await.unwrap();
        assert_eq!(&response.body[..], b"please sign in");
        assert_eq!(h.fetcher.call_count(&url("/me.html")), 2);
    }

    #[tokio::test]
    async fn test_unstorable_response_is_still_returned() {
        let h = harness();
        let mut response = FetchResponse::new(StatusCode::OK, "js");
        response
            .headers
            .insert("x-trace", http::HeaderValue::from_bytes(b"\xff").unwrap());
        h.fetcher.route(&url("/app.js"), response);

        let response = h.interceptor.handle(&FetchRequest::get(url("/app.js"))).await.unwrap();
        assert_eq!(&response.body[..], b"js");
        h.interceptor.flush().await;

        assert!(h.storage.keys().await.unwrap().is_empty());
        assert_eq!(h.interceptor.stats().await.skipped, 1);
    }
}
