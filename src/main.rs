//! Tracestore server
//!
//! Run with: cargo run
//!
//! Environment variables:
//! - TRACESTORE_HOST: Bind address (default: 0.0.0.0)
//! - TRACESTORE_PORT: Port number (default: 8080)
//! - TRACESTORE_MAX_PAGE_SIZE: Largest accepted query page (default: 1000)
//! - TRACESTORE_INGEST_BATCH_SIZE: Spans per store commit (default: 1000)
//! - TRACESTORE_STORE_TIMEOUT_MS: Deadline for each store call (default: 5000)
//! - TRACESTORE_DATA_DIR: Snapshot directory; unset keeps data in memory only
//! - TRACESTORE_SNAPSHOT_INTERVAL_SECS: Seconds between snapshots (default: 60)
//! - TRACESTORE_DEFAULT_PROJECT: Project used when `x-project-id` is absent
//! - RUST_LOG: Log level (default: tracestore=info,tower_http=info)

use tracestore::api::{run_server, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tracestore=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();

    tracing::info!("Tracestore configuration:");
    tracing::info!("  Host: {}:{}", config.host, config.port);
    tracing::info!("  Max page size: {}", config.limits.max_page_size);
    tracing::info!("  Ingest batch size: {}", config.ingest_batch_size);
    tracing::info!("  Store timeout: {:?}", config.store_timeout);
    match &config.data_dir {
        Some(dir) => tracing::info!(
            "  Snapshots: {} every {}s",
            dir.display(),
            config.snapshot_interval_secs
        ),
        None => tracing::info!("  Snapshots: DISABLED"),
    }
    if let Some(project) = &config.default_project {
        tracing::info!("  Default project: {}", project);
    }

    run_server(config).await
}
