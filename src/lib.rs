//! Global UPC - multi-store barcode reconciliation engine
//!
//! Finds, rewrites and audits product codes across relational stores and a
//! hosted commerce platform, streaming progress to the caller as it goes.

pub mod api;
pub mod application;
pub mod domain;
pub mod infrastructure;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::api::{AppState, router};
use crate::application::ReconciliationEngine;
use crate::infrastructure::logging::{init_logging_with_config, log_system_info};
use crate::infrastructure::{
    ConfigManager, DatabaseConnection, DefaultAdapterFactory, EventStreamEncoder,
    SqliteExclusionStore, SqliteHistoryRecorder, StaticStoreRegistry,
};

/// Loads configuration, wires the engine and serves the HTTP surface until
/// interrupted.
pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let manager = match config_path {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let config = manager.initialize_on_first_run().await?;

    init_logging_with_config(config.logging.clone())?;
    log_system_info();
    info!("Configuration: {:?}", manager.config_path());

    let database_url = config.database.resolved_url()?;
    let db = DatabaseConnection::new(&database_url).await?;
    db.migrate().await?;

    let history = Arc::new(SqliteHistoryRecorder::new(db.pool().clone()));
    let exclusions = Arc::new(SqliteExclusionStore::new(db.pool().clone()));
    let registry = Arc::new(StaticStoreRegistry::new(config.stores.clone()));
    let adapters = Arc::new(DefaultAdapterFactory::new(
        config.relational.clone(),
        config.commerce.clone(),
        config.engine.parameter_ceiling,
    ));

    let engine = ReconciliationEngine::new(
        registry,
        adapters,
        history.clone(),
        exclusions.clone(),
        config.engine.settings(),
    );
    let state = AppState::new(
        engine,
        EventStreamEncoder::new(config.engine.heartbeat_interval()),
        history,
        exclusions,
    );

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;
    info!("Listening on {} ({} stores configured)", config.server.bind_address, config.stores.len());

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
