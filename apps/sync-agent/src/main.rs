//! # Stockroom Sync Agent
//!
//! Background process that keeps the local store in sync with the cloud.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. tracing (RUST_LOG, default info,stockroom_sync=debug)               │
//! │  2. SyncConfig::load(path from argv[1] or the platform config dir)     │
//! │  3. Database::new (migrations run once)                                 │
//! │  4. [provider] section ──► persisted provider settings                  │
//! │  5. RestTransport + SyncEngine + SyncScheduler                          │
//! │  6. wait for Ctrl+C / SIGTERM ──► scheduler shutdown ──► pool close     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stockroom_db::{Database, DbConfig};
use stockroom_sync::{RestTransport, SyncConfig, SyncEngine, SyncScheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,stockroom_sync=debug")),
        )
        .with_target(true)
        .init();

    info!("Starting Stockroom sync agent...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = SyncConfig::load(config_path)?;
    info!(
        device = %config.device.name,
        batch_size = config.sync.batch_size,
        "Configuration loaded"
    );

    let db_path = config.database.resolved_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::new(
        DbConfig::new(&db_path).max_connections(config.database.max_connections),
    )
    .await?;
    info!(path = %db_path.display(), "Database ready");

    let metadata = db.metadata().get().await?;
    let transport = RestTransport::new(metadata.provider.clone(), config.http.clone())?;
    let engine = Arc::new(SyncEngine::new(
        db.clone(),
        Arc::new(transport),
        config.engine_settings(),
    ));

    if let Some(update) = config.provider_update() {
        let metadata = engine.update_settings(&update).await?;
        info!(configured = metadata.provider.is_configured(), "Provider settings applied");
    }
    if !engine.database().metadata().get().await?.sync_enabled {
        warn!("Sync is disabled; the scheduler will idle until it is enabled");
    }

    let scheduler = SyncScheduler::new(Arc::clone(&engine))
        .cleanup_after_days(config.sync.cleanup_after_days)
        .spawn()
        .await?;

    shutdown_signal().await;

    scheduler.shutdown().await?;
    db.close().await;
    info!("Sync agent stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received, stopping sync agent...");
}
