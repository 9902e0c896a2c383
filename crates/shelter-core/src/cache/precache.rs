//! Static resource precaching

use futures::future::try_join_all;
use shelter_fetch::{FetchRequest, Fetcher};
use shelter_storage::{CacheStorage, StoredResponse};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::policy::AdmissionPolicy;
use crate::entry::to_stored;
use crate::error::CoreError;
use crate::naming::CacheNamer;

/// Fills the static generation from the build manifest
pub struct Precacher {
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    policy: Arc<AdmissionPolicy>,
    namer: CacheNamer,
    manifest: Vec<String>,
}

impl Precacher {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        policy: Arc<AdmissionPolicy>,
        namer: CacheNamer,
        manifest: Vec<String>,
    ) -> Self {
        Self {
            storage,
            fetcher,
            policy,
            namer,
            manifest,
        }
    }

    /// Absolute URLs of every manifest entry, in manifest order
    pub fn manifest_urls(&self) -> Result<Vec<String>, CoreError> {
        self.manifest
            .iter()
            .map(|path| {
                self.policy
                    .resolve(path)
                    .map(|url| url.to_string())
                    .ok_or_else(|| CoreError::MalformedUrl(path.clone()))
            })
            .collect()
    }

    async fn fetch_entry(&self, url: String) -> Result<(String, StoredResponse), CoreError> {
        debug!("Precaching {}", url);

        let response = self
            .fetcher
            .fetch(&FetchRequest::get(url.clone()))
            .await
            .map_err(|e| CoreError::ManifestFetch {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        if !response.ok() {
            return Err(CoreError::ManifestFetch {
                url,
                reason: format!("status {}", response.status),
            });
        }

        match to_stored(&response) {
            Ok(stored) => Ok((url, stored)),
            Err(e) => Err(CoreError::ManifestFetch {
                url,
                reason: e.to_string(),
            }),
        }
    }

    /// Fetch every manifest entry and store it in the static generation
    ///
    /// All or nothing: if any entry fails to fetch, nothing is written; if
    /// a write fails, the static generation is deleted again. Either way the
    /// whole install step has to be retried. Manifest entries bypass
    /// admission control.
    pub async fn cache_static_resources(&self) -> Result<usize, CoreError> {
        let cache_id = self.namer.static_cache_id();
        info!(
            "Precaching {} resources into {}",
            self.manifest.len(),
            cache_id
        );

        let cache = self.storage.open(&cache_id).await?;
        let urls = self.manifest_urls()?;

        let fetched = try_join_all(urls.into_iter().map(|url| self.fetch_entry(url))).await?;

        let count = fetched.len();
        for (url, stored) in fetched {
            if let Err(e) = self.storage.put(&cache, &url, stored).await {
                warn!("Failed to store {} in {}: {}", url, cache_id, e);
                self.discard(&cache_id).await;
                return Err(e.into());
            }
        }

        info!("Precached {} resources into {}", count, cache_id);
        Ok(count)
    }

    /// Drop a partially filled static generation
    async fn discard(&self, cache_id: &str) {
        match self.storage.delete(cache_id).await {
            Ok(_) => info!("Discarded incomplete cache {}", cache_id),
            Err(e) => warn!("Failed to discard incomplete cache {}: {}", cache_id, e),
        }
    }
}
