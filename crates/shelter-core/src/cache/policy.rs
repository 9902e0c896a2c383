//! Cache admission policy

use shelter_fetch::{FetchRequest, FetchResponse, ResponseType};
use std::borrow::Cow;
use std::fmt;
use url::Url;

use crate::config::AdmissionConfig;

/// Why a request or response was kept out of the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Request URL is not on the serving origin (or could not be parsed)
    CrossOrigin,
    /// Request path is under a blacklisted prefix
    Blacklisted(String),
    /// Request carries credentials, so the response may be personalised
    Credentials(String),
    /// Request asks for part of the resource
    RangeRequest,
    /// Response carries a header that may hold session data
    SensitiveHeader(String),
    /// Response status is outside the success range
    Status(u16),
    /// Response type cannot be safely reused
    ResponseType(ResponseType),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::CrossOrigin => write!(f, "cross-origin request"),
            SkipReason::Blacklisted(prefix) => write!(f, "path under blacklisted prefix {}", prefix),
            SkipReason::Credentials(name) => write!(f, "request carries {}", name),
            SkipReason::RangeRequest => write!(f, "range request"),
            SkipReason::SensitiveHeader(name) => write!(f, "sensitive header {}", name),
            SkipReason::Status(status) => write!(f, "status {}", status),
            SkipReason::ResponseType(t) => write!(f, "{} response", t),
        }
    }
}

/// Admission control for the cache
///
/// All predicates are total: input that cannot be parsed as a URL always
/// takes the branch that keeps it out of the cache.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    origin: Url,
    blacklist_prefixes: Vec<String>,
    sensitive_headers: Vec<String>,
    credential_headers: Vec<String>,
    /// Lowercased, each with a leading dot
    cacheable_extensions: Vec<String>,
}

impl AdmissionPolicy {
    pub fn new(origin: Url, config: &AdmissionConfig) -> Self {
        let cacheable_extensions = config
            .cacheable_extensions
            .iter()
            .map(|ext| format!(".{}", ext.trim_start_matches('.').to_ascii_lowercase()))
            .collect();
        let lowercase = |headers: &[String]| -> Vec<String> {
            headers.iter().map(|h| h.to_ascii_lowercase()).collect()
        };

        Self {
            origin,
            blacklist_prefixes: config.blacklist_prefixes.clone(),
            sensitive_headers: lowercase(&config.sensitive_headers),
            credential_headers: lowercase(&config.credential_headers),
            cacheable_extensions,
        }
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Resolve an absolute or root-relative URL against the serving origin
    pub fn resolve(&self, url: &str) -> Option<Url> {
        self.origin.join(url).ok()
    }

    /// Whether a URL names a static asset
    ///
    /// True for paths ending in a cacheable extension, and for the
    /// application root and its index document.
    pub fn is_cacheable_asset(&self, url: &str) -> bool {
        let Some(url) = self.resolve(url) else {
            return false;
        };
        let path = url.path();

        if path == "/" || path == "/index.html" {
            return true;
        }

        let path = path.to_ascii_lowercase();
        self.cacheable_extensions
            .iter()
            .any(|ext| path.ends_with(ext.as_str()))
    }

    /// Whether an absolute URL is on the serving origin
    pub fn is_allowed_origin(&self, url: &str) -> bool {
        match Url::parse(url) {
            Ok(url) => url.origin() == self.origin.origin(),
            Err(_) => false,
        }
    }

    /// Blacklisted prefix matching the URL's path, if any
    ///
    /// Unreserved characters written as percent-escapes are decoded first,
    /// so `/%61pi/` matches `/api/`.
    fn blacklisted_prefix(&self, url: &str) -> Option<&str> {
        let url = Url::parse(url).ok()?;
        let path = decode_unreserved(url.path());
        self.blacklist_prefixes
            .iter()
            .find(|prefix| path.starts_with(prefix.as_str()))
            .map(String::as_str)
    }

    /// First credential header present on a request, if any
    fn credential_header(&self, request: &FetchRequest) -> Option<&str> {
        self.credential_headers
            .iter()
            .find(|name| request.headers.contains_key(name.as_str()))
            .map(String::as_str)
    }

    /// First sensitive header present on a response, if any
    fn sensitive_header(&self, response: &FetchResponse) -> Option<&str> {
        self.sensitive_headers
            .iter()
            .find(|name| response.headers.contains_key(name.as_str()))
            .map(String::as_str)
    }

    /// The first reason a request/response pair must not be cached
    ///
    /// With no response only the request-side checks apply (origin,
    /// blacklist, credentials, range). Every condition is sufficient on its
    /// own. Partial content is never stored, even though 206 falls inside
    /// the accepted status range.
    pub fn skip_reason(
        &self,
        request: &FetchRequest,
        response: Option<&FetchResponse>,
    ) -> Option<SkipReason> {
        if !self.is_allowed_origin(&request.url) {
            return Some(SkipReason::CrossOrigin);
        }

        if let Some(prefix) = self.blacklisted_prefix(&request.url) {
            return Some(SkipReason::Blacklisted(prefix.to_string()));
        }

        if let Some(name) = self.credential_header(request) {
            return Some(SkipReason::Credentials(name.to_string()));
        }

        if request.headers.contains_key(http::header::RANGE) {
            return Some(SkipReason::RangeRequest);
        }

        let response = response?;

        if let Some(name) = self.sensitive_header(response) {
            return Some(SkipReason::SensitiveHeader(name.to_string()));
        }

        let status = response.status.as_u16();
        if !(200..299).contains(&status) || status == 206 {
            return Some(SkipReason::Status(status));
        }

        if !matches!(response.response_type, ResponseType::Basic | ResponseType::Cors) {
            return Some(SkipReason::ResponseType(response.response_type));
        }

        None
    }

    /// Whether a request/response pair must be kept out of the cache
    pub fn should_skip_caching(
        &self,
        request: &FetchRequest,
        response: Option<&FetchResponse>,
    ) -> bool {
        self.skip_reason(request, response).is_some()
    }
}

/// Decode percent-escapes of unreserved characters (RFC 3986 section 2.3)
///
/// Other escapes are left as written.
fn decode_unreserved(path: &str) -> Cow<'_, str> {
    if !path.contains('%') {
        return Cow::Borrowed(path);
    }

    let bytes = path.as_bytes();
    let mut out = String::with_capacity(path.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && let Some(hex) = path.get(i + 1..i + 3)
            && let Ok(byte) = u8::from_str_radix(hex, 16)
            && (byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~'))
        {
            out.push(byte as char);
            i += 3;
            continue;
        }
        // `Url` paths are ASCII
        out.push(bytes[i] as char);
        i += 1;
    }
    Cow::Owned(out)
}
