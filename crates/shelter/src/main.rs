//! Shelter - Versioned offline cache in front of a web application

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;
mod server;

use config::Config;
use server::{AppState, create_router};
use shelter_core::CacheWorker;
use shelter_fetch::{HttpFetcher, HttpFetcherConfig};
use shelter_storage::{CacheStorage, LocalStorage, MemoryStorage};

/// Shelter - Versioned offline cache in front of a web application
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    /// Bind address
    #[arg(long, env = "SHELTER_BIND")]
    bind: Option<String>,

    /// Port
    #[arg(short, long, env = "SHELTER_PORT")]
    port: Option<u16>,

    /// Application version; selects the cache generation
    #[arg(long, env = "SHELTER_CACHE_VERSION")]
    cache_version: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let mut config = Config::load(&args.config)?;
    if let Some(version) = args.cache_version {
        config.cache.version = version;
    }

    // Initialize logging
    init_logging(&config.logging.level, &config.logging.format);

    info!("Starting Shelter v{}", env!("CARGO_PKG_VERSION"));

    let worker_config = config.worker_config()?;
    let origin = worker_config.origin.clone();

    // Initialize storage backend
    let storage = build_storage(&config).await?;

    // Initialize network client
    let fetcher = Arc::new(HttpFetcher::new(HttpFetcherConfig {
        origin: origin.clone(),
        timeout: config.origin_timeout(),
        skip_tls_verify: config.origin.skip_tls_verify,
    })?);

    // Install and activate the current generation
    let worker = Arc::new(CacheWorker::new(worker_config, storage, fetcher)?);
    install_with_retry(
        &worker,
        config.cache.install_attempts,
        Duration::from_secs(config.cache.install_retry_secs),
    )
    .await?;

    let report = worker.activate().await?;
    if !report.is_complete() {
        warn!(
            "{} obsolete caches could not be deleted; they will be retried on next activation",
            report.failed.len()
        );
    }

    // Create router
    let state = AppState::new(worker.clone(), origin.clone(), config.server.max_body_bytes);
    let app = create_router(state).layer(TraceLayer::new_for_http());

    // Determine bind address
    let bind_addr = args.bind.unwrap_or(config.server.bind_address);
    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", bind_addr, port).parse()?;

    info!("Listening on {}", addr);
    info!("Origin: {}", origin);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let in-flight cache writes land before exiting
    worker.flush().await;

    info!("Server stopped");
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn build_storage(config: &Config) -> Result<Arc<dyn CacheStorage>> {
    match config.storage.backend.as_str() {
        "memory" => {
            let storage = match config.storage.memory.quota_bytes {
                Some(quota) => MemoryStorage::with_quota(quota),
                None => MemoryStorage::new(),
            };
            info!("Using in-memory cache storage");
            Ok(Arc::new(storage))
        }
        "local" => {
            let path = &config.storage.local.path;
            let storage = LocalStorage::new(path)
                .await
                .with_context(|| format!("Failed to open cache storage at {}", path))?;
            info!("Using local cache storage at {}", path);
            Ok(Arc::new(storage))
        }
        other => bail!("Unknown storage backend: {}", other),
    }
}

/// Run the install step, retrying the whole step on failure
async fn install_with_retry(worker: &CacheWorker, attempts: u32, delay: Duration) -> Result<()> {
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match worker.install().await {
            Ok(count) => {
                info!("Precached {} resources on attempt {}", count, attempt);
                return Ok(());
            }
            Err(e) if attempt < attempts => {
                warn!(
                    "Install attempt {}/{} failed: {}; retrying in {:?}",
                    attempt, attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Install failed after {} attempts", attempts));
            }
        }
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
