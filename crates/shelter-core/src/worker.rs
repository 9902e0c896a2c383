//! Install/activate lifecycle around the interceptor

use parking_lot::RwLock;
use shelter_fetch::{FetchRequest, FetchResponse, Fetcher};
use shelter_storage::CacheStorage;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{AdmissionPolicy, CleanupReport, GenerationManager, Precacher};
use crate::config::WorkerConfig;
use crate::error::CoreError;
use crate::interceptor::{CacheStats, FetchInterceptor};
use crate::naming::CacheNamer;

/// Lifecycle state of a cache worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, nothing precached yet (also the state after a failed install)
    Parsed,
    Installing,
    /// Static generation filled, old generations still present
    Installed,
    Activating,
    /// Old generations removed; serving cache-first
    Activated,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime cache manager for one deployed version
///
/// Install and activation are strictly ordered before cache-first serving:
/// until activation has finished every request goes to the network.
pub struct CacheWorker {
    state: RwLock<WorkerState>,
    namer: CacheNamer,
    precacher: Precacher,
    generations: GenerationManager,
    interceptor: FetchInterceptor,
}

impl CacheWorker {
    pub fn new(
        config: WorkerConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let namer = CacheNamer::new(&config.namespace, &config.version);
        let policy = Arc::new(AdmissionPolicy::new(config.origin.clone(), &config.admission));

        for path in &config.manifest {
            if !policy.is_cacheable_asset(path) {
                warn!("Manifest entry {} does not look like a static asset", path);
            }
        }

        let precacher = Precacher::new(
            storage.clone(),
            fetcher.clone(),
            policy.clone(),
            namer.clone(),
            config.manifest,
        );
        let manifest_urls = precacher.manifest_urls()?;
        let generations = GenerationManager::new(storage.clone(), namer.clone());
        let interceptor = FetchInterceptor::new(storage, fetcher, policy, namer.clone(), manifest_urls);

        info!(
            "Cache worker for {} (static: {}, runtime: {})",
            namer.version(),
            namer.static_cache_id(),
            namer.runtime_cache_id()
        );

        Ok(Self {
            state: RwLock::new(WorkerState::Parsed),
            namer,
            precacher,
            generations,
            interceptor,
        })
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    pub fn namer(&self) -> &CacheNamer {
        &self.namer
    }

    pub async fn stats(&self) -> CacheStats {
        self.interceptor.stats().await
    }

    /// Move from one of `from` to `to`, or fail with the current state
    fn transition(&self, from: &[WorkerState], to: WorkerState) -> Result<(), CoreError> {
        let mut state = self.state.write();
        if !from.contains(&*state) {
            return Err(CoreError::InvalidState(format!(
                "cannot move to {} from {}",
                to, *state
            )));
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.write() = state;
    }

    /// Precache the manifest into the static generation
    ///
    /// On failure the worker returns to `Parsed` so the whole install step
    /// can be retried.
    pub async fn install(&self) -> Result<usize, CoreError> {
        self.transition(&[WorkerState::Parsed], WorkerState::Installing)?;
        info!("Installing version {}", self.namer.version());

        match self.precacher.cache_static_resources().await {
            Ok(count) => {
                self.set_state(WorkerState::Installed);
                info!("Installed version {} ({} resources)", self.namer.version(), count);
                Ok(count)
            }
            Err(e) => {
                self.set_state(WorkerState::Parsed);
                warn!("Install of version {} failed: {}", self.namer.version(), e);
                Err(e)
            }
        }
    }

    /// Remove obsolete generations and start serving cache-first
    pub async fn activate(&self) -> Result<CleanupReport, CoreError> {
        self.transition(&[WorkerState::Installed], WorkerState::Activating)?;
        info!("Activating version {}", self.namer.version());

        match self.generations.cleanup_obsolete_generations().await {
            Ok(report) => {
                self.set_state(WorkerState::Activated);
                info!("Activated version {}", self.namer.version());
                Ok(report)
            }
            Err(e) => {
                self.set_state(WorkerState::Installed);
                warn!("Activation of version {} failed: {}", self.namer.version(), e);
                Err(e)
            }
        }
    }

    /// Install then activate
    pub async fn start(&self) -> Result<CleanupReport, CoreError> {
        self.install().await?;
        self.activate().await
    }

    /// Handle an intercepted request according to the lifecycle state
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<FetchResponse, CoreError> {
        if self.state() == WorkerState::Activated {
            self.interceptor.handle(request).await
        } else {
            self.interceptor.passthrough(request).await
        }
    }

    /// Wait for detached cache writes
    pub async fn flush(&self) {
        self.interceptor.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdmissionConfig;
    use crate::testing::FakeFetcher;
    use http::StatusCode;
    use shelter_storage::{CacheHandle, MemoryStorage};
    use url::Url;

    fn config(version: &str) -> WorkerConfig {
        WorkerConfig {
            origin: Url::parse("https://mood.test").unwrap(),
            namespace: "mood".to_string(),
            version: version.to_string(),
            manifest: vec!["/".to_string(), "/app.css".to_string()],
            admission: AdmissionConfig::default(),
        }
    }

    fn online_fetcher() -> Arc<FakeFetcher> {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.route("https://mood.test/", FetchResponse::new(StatusCode::OK, "shell"));
        fetcher.route("https://mood.test/app.css", FetchResponse::new(StatusCode::OK, "css"));
        fetcher
    }

    #[tokio::test]
    async fn test_lifecycle_order_is_enforced() {
        let storage = Arc::new(MemoryStorage::new());
        let worker = CacheWorker::new(config("1"), storage, online_fetcher()).unwrap();

        assert!(matches!(worker.activate().await, Err(CoreError::InvalidState(_))));
        assert_eq!(worker.state(), WorkerState::Parsed);

        worker.install().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Installed);
        assert!(matches!(worker.install().await, Err(CoreError::InvalidState(_))));

        worker.activate().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_network_only_until_activated() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = online_fetcher();
        let worker = CacheWorker::new(config("1"), storage, fetcher.clone()).unwrap();

        worker.install().await.unwrap();
        let calls_after_install = fetcher.calls().len();

        // Installed but not active: the precached copy is not used yet
        worker.handle_fetch(&FetchRequest::get("https://mood.test/app.css")).await.unwrap();
        assert_eq!(fetcher.calls().len(), calls_after_install + 1);

        worker.activate().await.unwrap();
        worker.handle_fetch(&FetchRequest::get("https://mood.test/app.css")).await.unwrap();
        assert_eq!(fetcher.calls().len(), calls_after_install + 1);
    }

    #[tokio::test]
    async fn test_failed_install_can_be_retried() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.set_offline(true);
        let worker = CacheWorker::new(config("1"), storage.clone(), fetcher.clone()).unwrap();

        assert!(matches!(worker.install().await, Err(CoreError::ManifestFetch { .. })));
        assert_eq!(worker.state(), WorkerState::Parsed);

        fetcher.set_offline(false);
        fetcher.route("https://mood.test/", FetchResponse::new(StatusCode::OK, "shell"));
        fetcher.route("https://mood.test/app.css", FetchResponse::new(StatusCode::OK, "css"));
        assert_eq!(worker.install().await.unwrap(), 2);

        let cache = CacheHandle::new("mood-static-1");
        assert_eq!(storage.entries(&cache).await.unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut bad = config("1");
        bad.manifest = vec!["app.css".to_string()];
        let result = CacheWorker::new(bad, Arc::new(MemoryStorage::new()), online_fetcher());
        assert!(matches!(result, Err(CoreError::InvalidConfig(_))));
    }
}
