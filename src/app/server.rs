use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState};
use super::db::{CrmDb, DbHandle};
use super::ws;
use crate::config::{CrmConfig, PaginationSection};

/// Configuration for the CRM server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub pagination: PaginationSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&CrmConfig::default())
    }
}

impl From<&CrmConfig> for ServerConfig {
    fn from(config: &CrmConfig) -> Self {
        Self {
            bind_addr: config.server.bind_addr(),
            db_path: config.server.db_path.clone(),
            dev_mode: config.server.dev_mode,
            pagination: config.pagination,
        }
    }
}

/// Build the full application router: REST API plus the `/ws` change feed.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open (and migrate) the database at `path`, creating its directory.
pub fn open_database(path: &std::path::Path) -> Result<CrmDb> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    CrmDb::new(path).context("Failed to initialize CRM database")
}

/// Start the CRM server and run until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let db = open_database(&config.db_path)?;
    let state = Arc::new(AppState::new(DbHandle::new(db), config.pagination));

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, db = %config.db_path.display(), dev_mode = config.dev_mode, "CRM server listening");
    println!("CRM running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
