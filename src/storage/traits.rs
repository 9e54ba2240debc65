use crate::record::LogRecord;
use crate::rollup::bucket::Granularity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<duckdb::Error> for StorageError {
    fn from(e: duckdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// One dimension group returned by an aggregation query over the raw store.
/// Absent dimensions come back as empty strings.
#[derive(Debug, Clone)]
pub struct RawAggregate {
    pub level: String,
    pub service: String,
    pub log_type: String,
    pub enterprise_id: String,
    pub count: u64,
    pub error_count: u64,
    pub bytes_total: u64,
    pub latency_p50: Option<f64>,
    pub latency_p95: Option<f64>,
    pub latency_p99: Option<f64>,
}

/// Composite key of a rollup row. Dimension fields use empty-string defaults
/// so the unique index covers every row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RollupKey {
    pub bucket: String,
    pub granularity: Granularity,
    pub level: String,
    pub service: String,
    pub log_type: String,
    pub enterprise_id: String,
}

/// Metric columns of a rollup row. Always written whole, never summed into.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollupMetrics {
    pub count: u64,
    pub error_count: u64,
    pub bytes_total: u64,
    pub latency_p50: Option<f64>,
    pub latency_p95: Option<f64>,
    pub latency_p99: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollupRow {
    #[serde(flatten)]
    pub key: RollupKey,
    #[serde(flatten)]
    pub metrics: RollupMetrics,
    pub modified_at: DateTime<Utc>,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn init_schema(&self) -> Result<(), StorageError>;

    /// Connectivity and permission check: the backend must be reachable and
    /// both the raw and rollup tables accessible.
    async fn probe(&self) -> Result<(), StorageError>;

    async fn insert_log(&self, record: &LogRecord) -> Result<(), StorageError>;

    async fn count_logs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StorageError>;

    /// Group raw logs in `[start, end)` by the dimension tuple and compute
    /// the aggregate metrics for each group.
    async fn aggregate_logs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawAggregate>, StorageError>;

    async fn get_rollup(&self, key: &RollupKey) -> Result<Option<RollupRow>, StorageError>;

    async fn insert_rollup(
        &self,
        key: &RollupKey,
        metrics: &RollupMetrics,
    ) -> Result<(), StorageError>;

    async fn update_rollup(
        &self,
        key: &RollupKey,
        metrics: &RollupMetrics,
    ) -> Result<(), StorageError>;

    async fn list_rollups(
        &self,
        granularity: Granularity,
        bucket: Option<&str>,
    ) -> Result<Vec<RollupRow>, StorageError>;
}
