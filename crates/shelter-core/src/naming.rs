//! Versioned cache names

use std::fmt;

/// Logical cache generation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    /// Precached build assets
    Static,
    /// Responses cached while serving traffic
    Runtime,
}

impl Generation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Generation::Static => "static",
            Generation::Runtime => "runtime",
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derives cache names from the application namespace and a version tag
///
/// Every name starts with `"{namespace}-"`, which is how caches owned by
/// this application are told apart from others in the same storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNamer {
    namespace: String,
    version: String,
}

impl CacheNamer {
    pub fn new(namespace: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            version: version.into(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Prefix shared by every cache of this application
    pub fn namespace_prefix(&self) -> String {
        format!("{}-", self.namespace)
    }

    pub fn cache_id(&self, generation: Generation) -> String {
        format!("{}-{}-{}", self.namespace, generation, self.version)
    }

    pub fn static_cache_id(&self) -> String {
        self.cache_id(Generation::Static)
    }

    pub fn runtime_cache_id(&self) -> String {
        self.cache_id(Generation::Runtime)
    }

    /// Whether a cache name belongs to this application's namespace
    pub fn owns(&self, name: &str) -> bool {
        name.starts_with(&self.namespace_prefix())
    }

    /// Whether a cache name is one of the current generations
    pub fn is_current(&self, name: &str) -> bool {
        name == self.static_cache_id() || name == self.runtime_cache_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids() {
        let namer = CacheNamer::new("mood", "1.0.1");
        assert_eq!(namer.static_cache_id(), "mood-static-1.0.1");
        assert_eq!(namer.runtime_cache_id(), "mood-runtime-1.0.1");
        assert_ne!(namer.static_cache_id(), namer.runtime_cache_id());
    }

    #[test]
    fn test_ownership() {
        let namer = CacheNamer::new("mood", "1.0.2");
        assert!(namer.owns("mood-static-1.0.1"));
        assert!(namer.owns(&namer.runtime_cache_id()));
        assert!(!namer.owns("moodboard-static-1"));
        assert!(!namer.owns("other-app"));

        assert!(namer.is_current("mood-static-1.0.2"));
        assert!(!namer.is_current("mood-static-1.0.1"));
    }
}
