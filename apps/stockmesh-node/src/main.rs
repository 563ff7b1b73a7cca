//! # stockmesh-node
//!
//! Runs one mesh node: a warehouse replica, or a blind relay when
//! `SYNC_ROLE=blind_relay`.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. tracing (RUST_LOG, default "info,stockmesh=debug")                 │
//! │  2. SyncConfig::load  (defaults → TOML → env → validate)               │
//! │  3. Database          (SQLite file, migrations)                        │
//! │  4. MeshServer        (if server.enabled)                              │
//! │  5. SyncEngine::start (scheduler, realtime, health, relay, upkeep)     │
//! │  6. wait for Ctrl+C / SIGTERM, then stop engine and server             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stockmesh_db::{Database, DbConfig};
use stockmesh_sync::{MeshServer, SyncConfig, SyncEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,stockmesh=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting stockmesh node...");

    let config = SyncConfig::load(None).context("loading sync configuration")?;
    info!(
        instance_id = %config.node.instance_id,
        role = %config.role.as_str(),
        routes = config.routes.len(),
        relay = config.relay.url.is_some(),
        "Configuration loaded"
    );

    let db_config = DbConfig::new(&config.database.path).max_connections(config.database.max_connections.max(1));
    let db = Arc::new(
        Database::new(db_config)
            .await
            .with_context(|| format!("opening database {}", config.database.path))?,
    );
    info!(path = %config.database.path, "Database ready");

    let server_enabled = config.server.enabled;
    let bind_address = config.server.bind_address.clone();
    let engine = Arc::new(SyncEngine::new(config, db).await.context("creating sync engine")?);

    let server = if server_enabled {
        let handle = MeshServer::new(engine.clone())
            .start(&bind_address)
            .await
            .context("starting mesh server")?;
        info!(addr = %handle.local_addr(), "Mesh server listening");
        Some(handle)
    } else {
        None
    };

    let engine_handle = engine.start().await.context("starting sync engine")?;

    shutdown_signal().await;

    engine_handle.shutdown().await;
    if let Some(server) = server {
        server.shutdown().await;
    }

    info!("Node shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
