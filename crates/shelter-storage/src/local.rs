//! Local disk storage backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{CacheHandle, CacheStorage, StoredResponse, compute_sha256};
use crate::error::StorageError;

/// Local disk storage backend
///
/// Stores caches in a directory per cache name:
/// `<base_path>/caches/<hex(name)>/<sha256(url)>.json` holds the entry
/// metadata and points at a body file in the same directory. The metadata
/// file is renamed into place last, so an entry becomes visible only once
/// its body is fully written.
pub struct LocalStorage {
    caches_path: PathBuf,
    /// Serializes metadata commits so each replaced body is removed exactly once
    commit_lock: Mutex<()>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    url: String,
    status: u16,
    response_type: String,
    headers: Vec<(String, String)>,
    body_file: String,
    stored_at: DateTime<Utc>,
}

impl LocalStorage {
    /// Create a new local storage backend
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let caches_path = base_path.as_ref().join("caches");
        fs::create_dir_all(&caches_path).await?;

        info!("Initialized local cache storage at {:?}", caches_path);

        Ok(Self {
            caches_path,
            commit_lock: Mutex::new(()),
        })
    }

    /// Directory holding a cache's entries
    fn cache_dir(&self, name: &str) -> PathBuf {
        self.caches_path.join(hex::encode(name.as_bytes()))
    }

    /// Metadata file path for a URL inside a cache
    fn meta_path(&self, name: &str, url: &str) -> PathBuf {
        self.cache_dir(name)
            .join(format!("{}.json", compute_sha256(url.as_bytes())))
    }

    async fn read_meta(path: &Path) -> Result<Option<EntryMeta>, StorageError> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn ensure_cache_exists(&self, name: &str) -> Result<PathBuf, StorageError> {
        let dir = self.cache_dir(name);
        match fs::metadata(&dir).await {
            Ok(m) if m.is_dir() => Ok(dir),
            Ok(_) => Err(StorageError::Corrupt(format!("{:?} is not a directory", dir))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[async_trait]
impl CacheStorage for LocalStorage {
    async fn open(&self, name: &str) -> Result<CacheHandle, StorageError> {
        let dir = self.cache_dir(name);
        fs::create_dir_all(&dir).await?;
        Ok(CacheHandle::new(name))
    }

    async fn match_url(
        &self,
        cache: &CacheHandle,
        url: &str,
    ) -> Result<Option<StoredResponse>, StorageError> {
        let meta_path = self.meta_path(cache.name(), url);
        let Some(meta) = Self::read_meta(&meta_path).await? else {
            return Ok(None);
        };

        if meta.url != url {
            warn!("Entry {:?} belongs to {}, not {}", meta_path, meta.url, url);
            return Ok(None);
        }

        let body_path = self.cache_dir(cache.name()).join(&meta.body_file);
        let body = match fs::read(&body_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Body missing for cached entry {}", url);
                return Ok(None);
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        Ok(Some(StoredResponse {
            status: meta.status,
            response_type: meta.response_type,
            headers: meta.headers,
            body: body.into(),
            stored_at: meta.stored_at,
        }))
    }

    async fn put(
        &self,
        cache: &CacheHandle,
        url: &str,
        response: StoredResponse,
    ) -> Result<(), StorageError> {
        let dir = self.ensure_cache_exists(cache.name()).await?;
        let meta_path = self.meta_path(cache.name(), url);
        let key = compute_sha256(url.as_bytes());
        let write_id = uuid::Uuid::new_v4();

        debug!("Writing {} ({} bytes) to {:?}", url, response.body.len(), dir);

        let body_file = format!("{}.{}.body", key, write_id);
        let body_path = dir.join(&body_file);
        if let Err(e) = fs::write(&body_path, &response.body).await {
            let _ = fs::remove_file(&body_path).await;
            return Err(StorageError::Io(e));
        }

        let meta = EntryMeta {
            url: url.to_string(),
            status: response.status,
            response_type: response.response_type,
            headers: response.headers,
            body_file: body_file.clone(),
            stored_at: response.stored_at,
        };
        let temp_path = dir.join(format!("{}.{}.tmp", key, write_id));

        let _commit = self.commit_lock.lock().await;
        let previous = Self::read_meta(&meta_path).await.ok().flatten();
        let committed = async {
            fs::write(&temp_path, serde_json::to_vec(&meta)?).await?;
            fs::rename(&temp_path, &meta_path).await?;
            Ok::<(), StorageError>(())
        }
        .await;

        if let Err(e) = committed {
            let _ = fs::remove_file(&temp_path).await;
            let _ = fs::remove_file(&body_path).await;
            return Err(e);
        }

        // Drop the body of the entry we just replaced
        if let Some(previous) = previous
            && previous.body_file != body_file
        {
            let _ = fs::remove_file(dir.join(previous.body_file)).await;
        }

        Ok(())
    }

    async fn entries(&self, cache: &CacheHandle) -> Result<Vec<String>, StorageError> {
        let dir = self.ensure_cache_exists(cache.name()).await?;
        let mut urls = Vec::new();

        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(meta) = Self::read_meta(&path).await? {
                urls.push(meta.url);
            }
        }

        urls.sort();
        Ok(urls)
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();

        let mut read_dir = match fs::read_dir(&self.caches_path).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(StorageError::Io(e)),
        };

        while let Some(entry) = read_dir.next_entry().await? {
            let file_name = entry.file_name();
            let decoded = file_name
                .to_str()
                .and_then(|s| hex::decode(s).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok());
            match decoded {
                Some(name) => names.push(name),
                None => debug!("Skipping foreign entry {:?} in cache storage", file_name),
            }
        }

        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        let dir = self.cache_dir(name);
        debug!("Deleting cache {} at {:?}", name, dir);

        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}
