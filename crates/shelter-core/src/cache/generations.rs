//! Cache generation cleanup

use futures::future::join_all;
use shelter_storage::CacheStorage;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::naming::CacheNamer;

/// Outcome of a cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Obsolete generations that were removed
    pub deleted: Vec<String>,
    /// Obsolete generations that could not be removed, with the error
    pub failed: Vec<(String, String)>,
    /// Current generations left in place
    pub retained: Vec<String>,
}

impl CleanupReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Removes every generation of this application that is not current
pub struct GenerationManager {
    storage: Arc<dyn CacheStorage>,
    namer: CacheNamer,
}

impl GenerationManager {
    pub fn new(storage: Arc<dyn CacheStorage>, namer: CacheNamer) -> Self {
        Self { storage, namer }
    }

    /// Delete all obsolete generations in the application namespace
    ///
    /// Caches outside the namespace are never touched. Deletions run
    /// concurrently and a failed deletion does not stop the others.
    pub async fn cleanup_obsolete_generations(&self) -> Result<CleanupReport, CoreError> {
        let names = self.storage.keys().await?;
        let mut report = CleanupReport::default();
        let mut obsolete = Vec::new();

        for name in names {
            if !self.namer.owns(&name) {
                debug!("Leaving foreign cache {}", name);
            } else if self.namer.is_current(&name) {
                report.retained.push(name);
            } else {
                obsolete.push(name);
            }
        }

        if obsolete.is_empty() {
            debug!("No obsolete cache generations");
            return Ok(report);
        }

        info!(
            "Deleting {} obsolete cache generation(s) for version {}",
            obsolete.len(),
            self.namer.version()
        );

        let results = join_all(obsolete.into_iter().map(|name| async move {
            let result = self.storage.delete(&name).await;
            (name, result)
        }))
        .await;

        for (name, result) in results {
            match result {
                Ok(existed) => {
                    debug!("Deleted cache generation {} (existed: {})", name, existed);
                    report.deleted.push(name);
                }
                Err(e) => {
                    warn!("Failed to delete cache generation {}: {}", name, e);
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        info!(
            "Cache cleanup complete: {} deleted, {} failed, {} retained",
            report.deleted.len(),
            report.failed.len(),
            report.retained.len()
        );

        Ok(report)
    }
}
