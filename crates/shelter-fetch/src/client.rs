//! Network client for the serving origin

use async_trait::async_trait;
use http::HeaderMap;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::error::FetchError;
use crate::types::{FetchRequest, FetchResponse, ResponseType};

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Whether a header is connection-specific
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Copy headers, dropping connection-specific ones
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// The network primitive the cache manager falls back to
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform a request and buffer the full response
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// HTTP fetcher configuration
#[derive(Clone, Debug)]
pub struct HttpFetcherConfig {
    /// Origin the application is served from; same-origin responses are "basic"
    pub origin: Url,
    /// Per-request timeout
    pub timeout: Option<Duration>,
    /// Skip TLS certificate verification
    pub skip_tls_verify: bool,
}

/// reqwest-backed fetcher
pub struct HttpFetcher {
    config: HttpFetcherConfig,
    client: Client,
}

impl HttpFetcher {
    /// Create a new HTTP fetcher
    pub fn new(config: HttpFetcherConfig) -> Result<Self, FetchError> {
        let mut builder = Client::builder();

        if config.skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder.build()?;

        info!("Created HTTP fetcher for origin {}", config.origin);

        Ok(Self { config, client })
    }

    pub fn origin(&self) -> &Url {
        &self.config.origin
    }

    /// Classify a response the way a browser would for the requesting origin
    fn classify(&self, url: &Url, headers: &HeaderMap) -> ResponseType {
        if url.origin() == self.config.origin.origin() {
            ResponseType::Basic
        } else if headers.contains_key(http::header::ACCESS_CONTROL_ALLOW_ORIGIN) {
            ResponseType::Cors
        } else {
            ResponseType::Opaque
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let url = Url::parse(&request.url)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", request.url, e)))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(FetchError::InvalidUrl(format!(
                "Unsupported scheme: {}",
                url.scheme()
            )));
        }

        debug!("Fetching {} {}", request.method, url);

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(strip_hop_by_hop(&request.headers));
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        let response = builder.send().await?;

        let status = response.status();
        let final_url = response.url().clone();
        let headers = strip_hop_by_hop(response.headers());
        let response_type = self.classify(&final_url, &headers);
        let body = response.bytes().await?;

        debug!(
            "Fetched {} -> {} ({}, {} bytes)",
            final_url,
            status,
            response_type,
            body.len()
        );

        Ok(FetchResponse {
            status,
            headers,
            body,
            response_type,
        })
    }
}
