use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::durability::{
    HealthMonitor, IngestError, IngestionCoordinator, OverflowQueue, ReconciliationProcessor,
};
use crate::record::LogRecord;
use crate::rollup::{AggregationScheduler, Granularity};
use crate::storage::Storage;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub queue: Arc<OverflowQueue>,
    pub health: Arc<HealthMonitor>,
    pub reconciler: Arc<ReconciliationProcessor>,
    pub scheduler: Arc<AggregationScheduler>,
    pub coordinator: Arc<IngestionCoordinator>,
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
}

/// POST /api/logs
pub async fn ingest_log(
    State(state): State<AppState>,
    Json(record): Json<LogRecord>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    match state.coordinator.write(record).await {
        Ok(outcome) => Ok(Json(json!({
            "stored": outcome.stored,
            "cached": outcome.cached,
        }))),
        Err(IngestError::Validation(e)) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        )),
        Err(e) => Err(internal_error(e)),
    }
}

/// GET /api/health
pub async fn get_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let health = state.health.state().await;
    Json(json!({
        "health": health,
        "recoveries": state.health.recoveries(),
        "reconciling": state.reconciler.is_draining(),
    }))
}

/// POST /api/health/check runs a probe cycle on demand.
pub async fn check_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let health = state.health.check_now().await;
    Json(json!({"health": health}))
}

/// GET /api/queue
pub async fn get_queue_info(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let info = state.queue.info().await.map_err(internal_error)?;
    Ok(Json(json!({"queue": info})))
}

/// POST /api/reconcile triggers a drain and waits for its report.
pub async fn trigger_reconcile(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let report = state.reconciler.drain().await.map_err(internal_error)?;
    Ok(Json(json!({"report": report})))
}

#[derive(Debug, Deserialize)]
pub struct RollupQuery {
    pub granularity: Granularity,
    pub bucket: Option<String>,
}

/// GET /api/rollups?granularity=hour&bucket=2025070415
pub async fn list_rollups(
    State(state): State<AppState>,
    Query(query): Query<RollupQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let rows = state
        .storage
        .list_rollups(query.granularity, query.bucket.as_deref())
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({"rollups": rows})))
}

#[derive(Debug, Deserialize)]
pub struct RunRollupRequest {
    pub granularity: Option<Granularity>,
    pub at: Option<DateTime<Utc>>,
}

/// POST /api/rollups/run recomputes buckets on demand.
pub async fn run_rollups(
    State(state): State<AppState>,
    Json(request): Json<RunRollupRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let outcomes = state
        .scheduler
        .manual_update(request.granularity, request.at)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({"updated": outcomes})))
}

/// GET /api/scheduler/status
pub async fn scheduler_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({"scheduler": state.scheduler.status()}))
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: u64,
}

#[derive(Debug, Deserialize)]
pub struct CountQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// GET /api/logs/count?start=...&end=...
pub async fn count_logs(
    State(state): State<AppState>,
    Query(query): Query<CountQuery>,
) -> Result<Json<CountResponse>, (StatusCode, Json<serde_json::Value>)> {
    let count = state
        .storage
        .count_logs(query.start, query.end)
        .await
        .map_err(internal_error)?;
    Ok(Json(CountResponse { count }))
}
