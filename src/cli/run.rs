use crate::config::parse::load_config;
use crate::durability::{HealthMonitor, IngestionCoordinator, OverflowQueue, ReconciliationProcessor};
use crate::rollup::AggregationScheduler;
use crate::storage::duckdb::DuckDbStorage;
use crate::storage::Storage;
use crate::web::{run_server, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::parse::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("web server error: {0}")]
    WebServer(String),
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/logtide/config.yml");
            eprintln!("  /etc/logtide/config.yml");
            eprintln!("\nUse --config <path> to specify a config file, or run 'logtide config init' to generate one.");
            std::process::exit(1);
        }
    };

    run_service(&config_path).await.map_err(|e| e.into())
}

async fn run_service(config_path: &PathBuf) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    info!(path = %config.storage.path.display(), "Initializing storage");
    let storage: Arc<dyn Storage> = Arc::new(DuckDbStorage::new(&config.storage.path)?);
    storage.init_schema().await?;

    let queue = Arc::new(OverflowQueue::new(
        config.durability.queue_path.clone(),
        config.durability.max_entries,
        config.durability.max_bytes,
    ));
    info!(path = %queue.path().display(), "Overflow queue ready");

    let reconciler = Arc::new(ReconciliationProcessor::new(
        storage.clone(),
        queue.clone(),
        config.durability.reconcile_batch_size,
    ));

    let health = Arc::new(HealthMonitor::new(storage.clone(), 5));

    // Recovery replays the whole backlog; steady probes only bother when
    // something is actually queued.
    {
        let reconciler = reconciler.clone();
        health.on_recovered(move || {
            let reconciler = reconciler.clone();
            tokio::spawn(async move {
                if let Err(e) = reconciler.drain().await {
                    warn!(error = %e, "Reconciliation after recovery failed");
                }
            });
        });
    }
    {
        let reconciler = reconciler.clone();
        let queue = queue.clone();
        health.on_steady(move || {
            let reconciler = reconciler.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                match queue.count().await {
                    Ok(0) | Err(_) => {}
                    Ok(_) => {
                        if let Err(e) = reconciler.drain().await {
                            warn!(error = %e, "Background reconciliation failed");
                        }
                    }
                }
            });
        });
    }

    health.start(Duration::from_secs(config.durability.probe_interval_seconds));

    let coordinator = Arc::new(IngestionCoordinator::new(
        storage.clone(),
        queue.clone(),
        health.clone(),
        reconciler.clone(),
    ));

    let scheduler = Arc::new(AggregationScheduler::new(
        storage.clone(),
        config.aggregation.hourly_offset_minutes,
    ));
    scheduler.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = AppState {
        storage,
        queue,
        health: health.clone(),
        reconciler,
        scheduler: scheduler.clone(),
        coordinator,
    };
    let web_config = config.web.clone();
    let web_handle = tokio::spawn(async move {
        run_server(state, web_config, shutdown_rx)
            .await
            .map_err(|e| RunError::WebServer(e.to_string()))
    });

    info!("logtide running, press Ctrl+C to stop");
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
    }

    let _ = shutdown_tx.send(true);
    scheduler.stop();
    health.stop();

    match web_handle.await {
        Ok(result) => result?,
        Err(e) => warn!(error = %e, "Web server task panicked"),
    }

    info!("Shutdown complete");
    Ok(())
}
