use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;

use crate::config::WebConfig;

use super::api::{
    check_health, count_logs, get_health, get_queue_info, ingest_log, list_rollups, run_rollups,
    scheduler_status, trigger_reconcile, AppState,
};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/logs", post(ingest_log))
        .route("/api/logs/count", get(count_logs))
        .route("/api/health", get(get_health))
        .route("/api/health/check", post(check_health))
        .route("/api/queue", get(get_queue_info))
        .route("/api/reconcile", post(trigger_reconcile))
        .route("/api/rollups", get(list_rollups))
        .route("/api/rollups/run", post(run_rollups))
        .route("/api/scheduler/status", get(scheduler_status))
        .with_state(state)
}

/// Start the HTTP API and serve until the shutdown signal flips true.
pub async fn run_server(
    state: AppState,
    web_config: WebConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&web_config.listen).await?;
    tracing::info!("Web server listening on {}", web_config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|&v| v).await;
            tracing::info!("Web server shutting down gracefully");
        })
        .await?;

    Ok(())
}
