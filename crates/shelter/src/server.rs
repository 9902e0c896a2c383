//! HTTP front end: every request is routed through the cache worker

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use serde_json::json;
use shelter_core::{CacheStats, CacheWorker, CoreError};
use shelter_fetch::{FetchRequest, FetchResponse, strip_hop_by_hop};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use url::Url;

/// State shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub worker: Arc<CacheWorker>,
    pub origin: Url,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(worker: Arc<CacheWorker>, origin: Url, max_body_bytes: usize) -> Self {
        Self {
            worker,
            origin,
            max_body_bytes,
        }
    }
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ProxyError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE"),
            ProxyError::Core(CoreError::Network(_)) => (StatusCode::BAD_GATEWAY, "NETWORK_ERROR"),
            ProxyError::Core(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = Json(json!({
            "errors": [{
                "code": code,
                "message": self.to_string(),
            }]
        }));

        (status, body).into_response()
    }
}

/// Health status response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub state: String,
    pub static_cache: String,
    pub runtime_cache: String,
    pub stats: CacheStats,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let namer = state.worker.namer();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: namer.version().to_string(),
        state: state.worker.state().to_string(),
        static_cache: namer.static_cache_id(),
        runtime_cache: namer.runtime_cache_id(),
        stats: state.worker.stats().await,
    })
}

/// Forward a request through the cache worker
async fn intercept(State(state): State<AppState>, request: Request) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();

    let body = to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|_| ProxyError::PayloadTooLarge(state.max_body_bytes))?;

    // Only the path and query come from the client; the origin is fixed
    let mut url = state.origin.clone();
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let fetch_request = FetchRequest {
        method: parts.method,
        url: url.to_string(),
        headers: strip_hop_by_hop(&parts.headers),
        body,
    };

    match state.worker.handle_fetch(&fetch_request).await {
        Ok(response) => Ok(into_http_response(response)),
        Err(e) => {
            warn!("Failed to serve {} {}: {}", fetch_request.method, fetch_request.url, e);
            Err(e.into())
        }
    }
}

fn into_http_response(response: FetchResponse) -> Response {
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = response.status;
    *out.headers_mut() = strip_hop_by_hop(&response.headers);
    out
}

/// Create the main router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/_shelter/health", get(health))
        .fallback(intercept)
        .with_state(state)
}
