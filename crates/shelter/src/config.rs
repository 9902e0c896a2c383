//! Configuration loading and management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shelter_core::{AdmissionConfig, WorkerConfig};
use std::path::Path;
use std::time::Duration;
use tracing::info;
use url::Url;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub origin: OriginConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest request body forwarded to the origin
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Origin the application is served from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    #[serde(default = "default_origin_url")]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub skip_tls_verify: bool,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            url: default_origin_url(),
            timeout_secs: default_timeout_secs(),
            skip_tls_verify: false,
        }
    }
}

/// Cache generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Root-relative paths precached on install
    #[serde(default = "default_manifest")]
    pub manifest: Vec<String>,
    /// How many times the install step is attempted before giving up
    #[serde(default = "default_install_attempts")]
    pub install_attempts: u32,
    #[serde(default = "default_install_retry_secs")]
    pub install_retry_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            version: default_version(),
            manifest: default_manifest(),
            install_attempts: default_install_attempts(),
            install_retry_secs: default_install_retry_secs(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "memory" or "local"
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub local: LocalStorageConfig,
    #[serde(default)]
    pub memory: MemoryStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            local: LocalStorageConfig::default(),
            memory: MemoryStorageConfig::default(),
        }
    }
}

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    #[serde(default = "default_local_path")]
    pub path: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            path: default_local_path(),
        }
    }
}

/// Memory storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryStorageConfig {
    pub quota_bytes: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024 // 10 MB
}

fn default_origin_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_namespace() -> String {
    "mood".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_manifest() -> Vec<String> {
    vec!["/".to_string(), "/index.html".to_string()]
}

fn default_install_attempts() -> u32 {
    3
}

fn default_install_retry_secs() -> u64 {
    5
}

fn default_backend() -> String {
    "local".to_string()
}

fn default_local_path() -> String {
    "./data/cache".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);

        if !config_path.exists() {
            info!("Config file not found at {}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        info!("Loaded configuration from {}", path);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin.url)
            .with_context(|| format!("Invalid origin URL: {}", self.origin.url))
    }

    pub fn origin_timeout(&self) -> Option<Duration> {
        (self.origin.timeout_secs > 0).then(|| Duration::from_secs(self.origin.timeout_secs))
    }

    /// Build the cache worker configuration
    pub fn worker_config(&self) -> Result<WorkerConfig> {
        let config = WorkerConfig {
            origin: self.origin_url()?,
            namespace: self.cache.namespace.clone(),
            version: self.cache.version.clone(),
            manifest: self.cache.manifest.clone(),
            admission: self.admission.clone(),
        };
        config.validate().context("Invalid cache configuration")?;
        Ok(config)
    }
}
