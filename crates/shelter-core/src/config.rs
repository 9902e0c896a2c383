//! Cache manager configuration

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use url::Url;

use crate::error::CoreError;

/// Admission control settings
///
/// Header names are matched case-insensitively; extensions may be given
/// with or without a leading dot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdmissionConfig {
    /// Path prefixes that always go to the network and are never cached
    #[serde(default = "default_blacklist_prefixes")]
    pub blacklist_prefixes: Vec<String>,
    /// Response headers whose presence vetoes caching
    #[serde(default = "default_sensitive_headers")]
    pub sensitive_headers: Vec<String>,
    /// Request headers carrying credentials; such requests are network-only
    #[serde(default = "default_credential_headers")]
    pub credential_headers: Vec<String>,
    /// File extensions treated as static assets
    #[serde(default = "default_cacheable_extensions")]
    pub cacheable_extensions: Vec<String>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            blacklist_prefixes: default_blacklist_prefixes(),
            sensitive_headers: default_sensitive_headers(),
            credential_headers: default_credential_headers(),
            cacheable_extensions: default_cacheable_extensions(),
        }
    }
}

fn default_blacklist_prefixes() -> Vec<String> {
    ["/api/", "/admin/", "/auth/"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_sensitive_headers() -> Vec<String> {
    ["set-cookie", "authorization"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_credential_headers() -> Vec<String> {
    ["cookie", "authorization"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_cacheable_extensions() -> Vec<String> {
    [
        "html", "css", "js", "json", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "woff",
        "woff2", "ttf", "otf",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Everything needed to build a cache worker for one deployment
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Origin the application is served from
    pub origin: Url,
    /// Application namespace shared by all cache names
    pub namespace: String,
    /// Build/version tag; changing it rolls over every generation
    pub version: String,
    /// Root-relative paths precached on install, in order
    pub manifest: Vec<String>,
    pub admission: AdmissionConfig,
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_namespace(&self.namespace).map_err(CoreError::InvalidConfig)?;
        if self.version.trim().is_empty() {
            return Err(CoreError::InvalidConfig("version cannot be empty".to_string()));
        }
        if self.origin.cannot_be_a_base() || !matches!(self.origin.scheme(), "http" | "https") {
            return Err(CoreError::InvalidConfig(format!(
                "origin must be an http(s) URL: {}",
                self.origin
            )));
        }
        validate_manifest(&self.manifest).map_err(CoreError::InvalidConfig)?;
        Ok(())
    }
}

/// Validate a cache namespace
///
/// Namespaces become part of every cache name, so they are limited to a
/// short run of ASCII letters, digits, `_`, `.` and `-`.
pub fn validate_namespace(namespace: &str) -> Result<(), String> {
    if namespace.is_empty() {
        return Err("namespace cannot be empty".to_string());
    }
    if namespace.len() > 64 {
        return Err("namespace cannot exceed 64 characters".to_string());
    }
    if !namespace
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        return Err(format!(
            "namespace '{}' may only contain ASCII letters, digits, '_', '.' and '-'",
            namespace
        ));
    }
    Ok(())
}

/// Validate a precache manifest
///
/// Every entry must be a root-relative path and appear only once.
pub fn validate_manifest(manifest: &[String]) -> Result<(), String> {
    let mut seen = HashSet::new();

    for path in manifest {
        if !path.starts_with('/') || path.starts_with("//") {
            return Err(format!("manifest entry '{}' must be root-relative", path));
        }
        if path.contains('#') {
            return Err(format!("manifest entry '{}' cannot contain a fragment", path));
        }
        if !seen.insert(path.as_str()) {
            return Err(format!("manifest entry '{}' is listed twice", path));
        }
    }

    Ok(())
}
