mod api;
mod arcgis;
mod catalog;
mod catalog_manager;
mod client_cache;
mod config;
mod error;
mod sync;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::arcgis::fetcher::Fetcher;
use crate::arcgis::walker::Walker;
use crate::catalog::db::CatalogDb;
use crate::catalog_manager::CatalogHandle;
use crate::client_cache::{CatalogCache, SystemClock};
use crate::config::Config;
use crate::sync::Synchronizer;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("catalog_syncd=info"))
        )
        .init();

    tracing::info!("Starting catalog-syncd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/catalog-syncd/catalog-syncd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {} ({} regions)", config_path, config.regions.len());

    // Open SQLite database
    let db = CatalogDb::open(&config.catalog.db_path)?;
    tracing::info!("Opened database at {:?}", config.catalog.db_path);

    // Compute initial hash
    let initial_services = db.list_all()?;
    let initial_hash = catalog::hash::compute_hash(&initial_services);
    tracing::info!("Initial catalog hash: {} ({} services)", initial_hash, initial_services.len());

    let (hash_tx, hash_rx) = watch::channel(initial_hash);

    // Start catalog thread
    let catalog_handle = CatalogHandle::spawn(db, hash_tx);

    let fetcher = Fetcher::new(config.fetch.clone()).context("Failed to build HTTP client")?;
    let walker = Walker::new(fetcher, Duration::from_millis(config.sync.folder_delay_ms));
    let synchronizer = Synchronizer::new(
        walker,
        catalog_handle.clone(),
        config.regions.clone(),
        Duration::from_millis(config.sync.region_delay_ms),
    );

    let cache = Arc::new(CatalogCache::new(catalog_handle.clone(), SystemClock, config.cache.ttl()));

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Drop cached listings whenever the catalog changes
    let invalidate_handle = tokio::spawn(client_cache::invalidate_on_change(
        Arc::clone(&cache),
        hash_rx.clone(),
        cancel.clone(),
    ));

    // Spawn maintenance and periodic sync task
    let mgr_cancel = cancel.clone();
    let mgr_catalog = catalog_handle.clone();
    let mgr_synchronizer = synchronizer.clone();
    let mgr_catalog_config = config.catalog.clone();
    let mgr_sync_config = config.sync.clone();
    let mgr_handle = tokio::spawn(async move {
        if let Err(e) = catalog_manager::run(
            mgr_catalog,
            mgr_synchronizer,
            mgr_catalog_config,
            mgr_sync_config,
            mgr_cancel,
        )
        .await
        {
            tracing::error!("Catalog manager error: {}", e);
        }
    });

    let listen = config.api.listen.clone();

    // Build API router
    let app_state = api::routes::AppState {
        catalog: catalog_handle.clone(),
        cache,
        synchronizer,
        hash_rx,
        config: Arc::new(config),
        cancel: cancel.clone(),
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind to {}", listen))?;

    tracing::info!("API listening on {}", listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation; running syncs stop before their next folder
    cancel.cancel();

    let _ = tokio::join!(invalidate_handle, mgr_handle, server_handle);

    // Shutdown catalog thread
    if let Err(e) = catalog_handle.shutdown().await {
        tracing::error!("Failed to shutdown catalog: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
