//! HTTP ingress for the orchestrator: the axum application and the server
//! lifecycle around it (database, adapter wiring, scheduling loop,
//! graceful shutdown).

pub mod api;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::adapters::AdapterRegistry;
use crate::engine::Orchestrator;
use crate::store::{Db, DbHandle};
use api::{AppState, SharedState};

/// Configuration for the orchestrator server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub tick_interval: Duration,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4780,
            db_path: PathBuf::from(".cadence/cadence.db"),
            tick_interval: Duration::from_secs(30),
            dev_mode: false,
        }
    }
}

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Start the server: open the database, wire the orchestrator with the
/// default adapters, spawn the scheduling loop, and serve the API.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = DbHandle::new(Db::new(&config.db_path).context("Failed to open database")?);

    let orchestrator = Arc::new(Orchestrator::new(db, AdapterRegistry::local()));
    tokio::spawn(Arc::clone(&orchestrator).run(config.tick_interval));

    let state = Arc::new(AppState { orchestrator });
    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(addr = %listener.local_addr()?, "cadence serving");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
    }
}
