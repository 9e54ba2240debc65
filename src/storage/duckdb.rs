use super::traits::{RawAggregate, RollupKey, RollupMetrics, RollupRow, Storage, StorageError};
use crate::record::LogRecord;
use crate::rollup::bucket::Granularity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// DuckDB implementation of the Storage trait.
///
/// The connection is shared behind a mutex and every call hops onto the
/// blocking pool, so callers only ever see async I/O.
pub struct DuckDbStorage {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path.as_ref())?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory DuckDB storage instance (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn parse_granularity(raw: &str, column: usize) -> Result<Granularity, duckdb::Error> {
    raw.parse::<Granularity>().map_err(|e| {
        duckdb::Error::FromSqlConversionFailure(
            column,
            duckdb::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

fn parse_timestamp(micros: i64, column: usize) -> Result<DateTime<Utc>, duckdb::Error> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        duckdb::Error::FromSqlConversionFailure(
            column,
            duckdb::types::Type::BigInt,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid timestamp",
            )),
        )
    })
}

fn rollup_row_from(row: &duckdb::Row<'_>) -> Result<RollupRow, duckdb::Error> {
    Ok(RollupRow {
        key: RollupKey {
            bucket: row.get(0)?,
            granularity: parse_granularity(&row.get::<_, String>(1)?, 1)?,
            level: row.get(2)?,
            service: row.get(3)?,
            log_type: row.get(4)?,
            enterprise_id: row.get(5)?,
        },
        metrics: RollupMetrics {
            count: row.get(6)?,
            error_count: row.get(7)?,
            bytes_total: row.get(8)?,
            latency_p50: row.get(9)?,
            latency_p95: row.get(10)?,
            latency_p99: row.get(11)?,
        },
        modified_at: parse_timestamp(row.get::<_, i64>(12)?, 12)?,
    })
}

const ROLLUP_COLUMNS: &str = "bucket, granularity, level, service, log_type, enterprise_id, \
     record_count, error_count, bytes_total, latency_p50, latency_p95, latency_p99, \
     epoch_us(modified_at)";

#[async_trait]
impl Storage for DuckDbStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            conn.execute(
                "CREATE TABLE IF NOT EXISTS raw_logs (
                    log_id UUID PRIMARY KEY,
                    timestamp TIMESTAMPTZ NOT NULL,
                    level VARCHAR NOT NULL,
                    message VARCHAR NOT NULL,
                    service VARCHAR,
                    log_type VARCHAR,
                    enterprise_id VARCHAR,
                    app_id VARCHAR,
                    user_id VARCHAR,
                    latency_ms DOUBLE,
                    bytes_sent UBIGINT,
                    extra VARCHAR,
                    ingestion_time TIMESTAMPTZ NOT NULL
                )",
                [],
            )?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_raw_logs_timestamp ON raw_logs(timestamp)",
                [],
            )?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_raw_logs_level ON raw_logs(level)",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS rollups (
                    bucket VARCHAR NOT NULL,
                    granularity VARCHAR NOT NULL,
                    level VARCHAR NOT NULL,
                    service VARCHAR NOT NULL,
                    log_type VARCHAR NOT NULL,
                    enterprise_id VARCHAR NOT NULL,
                    record_count UBIGINT NOT NULL,
                    error_count UBIGINT NOT NULL,
                    bytes_total UBIGINT NOT NULL,
                    latency_p50 DOUBLE,
                    latency_p95 DOUBLE,
                    latency_p99 DOUBLE,
                    modified_at TIMESTAMPTZ NOT NULL
                )",
                [],
            )?;

            conn.execute(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_rollups_key
                 ON rollups(bucket, granularity, level, service, log_type, enterprise_id)",
                [],
            )?;

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn probe(&self) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            // Reachability, then access to both target tables.
            conn.execute_batch("SELECT 1")?;
            conn.prepare("SELECT count(*) FROM raw_logs")?
                .query_row([], |row| row.get::<_, i64>(0))?;
            conn.prepare("SELECT count(*) FROM rollups")?
                .query_row([], |row| row.get::<_, i64>(0))?;

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn insert_log(&self, record: &LogRecord) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let record = record.clone();

        // The structured payload is flattened to a string only here, at the
        // backend boundary.
        let extra_json = match &record.extra {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let timestamp = record.timestamp.unwrap_or_else(Utc::now);

            conn.execute(
                "INSERT INTO raw_logs (log_id, timestamp, level, message, service, log_type,
                                       enterprise_id, app_id, user_id, latency_ms, bytes_sent,
                                       extra, ingestion_time)
                 VALUES (?, to_timestamp(? / 1000000.0), ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                         to_timestamp(? / 1000000.0))",
                duckdb::params![
                    Uuid::new_v4().to_string(),
                    timestamp.timestamp_micros(),
                    record.level.as_str(),
                    record.message,
                    record.service,
                    record.log_type,
                    record.enterprise_id,
                    record.app_id,
                    record.user_id,
                    record.latency_ms,
                    record.bytes_sent,
                    extra_json,
                    Utc::now().timestamp_micros(),
                ],
            )?;

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn count_logs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let conn = self.conn.clone();
        let start_micros = start.timestamp_micros();
        let end_micros = end.timestamp_micros();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let count = conn
                .prepare(
                    "SELECT count(*) FROM raw_logs
                     WHERE timestamp >= to_timestamp(? / 1000000.0)
                       AND timestamp < to_timestamp(? / 1000000.0)",
                )?
                .query_row(duckdb::params![start_micros, end_micros], |row| {
                    row.get::<_, i64>(0)
                })?;
            Ok::<u64, StorageError>(count as u64)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn aggregate_logs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawAggregate>, StorageError> {
        let conn = self.conn.clone();
        let start_micros = start.timestamp_micros();
        let end_micros = end.timestamp_micros();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT level,
                        coalesce(service, ''),
                        coalesce(log_type, ''),
                        coalesce(enterprise_id, ''),
                        count(*),
                        count(*) FILTER (WHERE level = 'error'),
                        coalesce(sum(bytes_sent), 0),
                        quantile_cont(latency_ms, 0.5),
                        quantile_cont(latency_ms, 0.95),
                        quantile_cont(latency_ms, 0.99)
                 FROM raw_logs
                 WHERE timestamp >= to_timestamp(? / 1000000.0)
                   AND timestamp < to_timestamp(? / 1000000.0)
                 GROUP BY 1, 2, 3, 4
                 ORDER BY 1, 2, 3, 4",
            )?;

            let rows = stmt.query_map(duckdb::params![start_micros, end_micros], |row| {
                Ok(RawAggregate {
                    level: row.get(0)?,
                    service: row.get(1)?,
                    log_type: row.get(2)?,
                    enterprise_id: row.get(3)?,
                    count: row.get::<_, i64>(4)? as u64,
                    error_count: row.get::<_, i64>(5)? as u64,
                    bytes_total: row.get::<_, i64>(6)? as u64,
                    latency_p50: row.get(7)?,
                    latency_p95: row.get(8)?,
                    latency_p99: row.get(9)?,
                })
            })?;

            let mut aggregates = Vec::new();
            for row in rows {
                aggregates.push(row?);
            }
            Ok(aggregates)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn get_rollup(&self, key: &RollupKey) -> Result<Option<RollupRow>, StorageError> {
        let conn = self.conn.clone();
        let key = key.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM rollups
                 WHERE bucket = ? AND granularity = ? AND level = ?
                   AND service = ? AND log_type = ? AND enterprise_id = ?",
                ROLLUP_COLUMNS
            ))?;

            let mut rows = stmt.query(duckdb::params![
                key.bucket,
                key.granularity.as_str(),
                key.level,
                key.service,
                key.log_type,
                key.enterprise_id,
            ])?;

            if let Some(row) = rows.next()? {
                Ok(Some(rollup_row_from(row)?))
            } else {
                Ok(None)
            }
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn insert_rollup(
        &self,
        key: &RollupKey,
        metrics: &RollupMetrics,
    ) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let key = key.clone();
        let metrics = metrics.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO rollups (bucket, granularity, level, service, log_type,
                                      enterprise_id, record_count, error_count, bytes_total,
                                      latency_p50, latency_p95, latency_p99, modified_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, to_timestamp(? / 1000000.0))",
                duckdb::params![
                    key.bucket,
                    key.granularity.as_str(),
                    key.level,
                    key.service,
                    key.log_type,
                    key.enterprise_id,
                    metrics.count,
                    metrics.error_count,
                    metrics.bytes_total,
                    metrics.latency_p50,
                    metrics.latency_p95,
                    metrics.latency_p99,
                    Utc::now().timestamp_micros(),
                ],
            )?;

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn update_rollup(
        &self,
        key: &RollupKey,
        metrics: &RollupMetrics,
    ) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let key = key.clone();
        let metrics = metrics.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "UPDATE rollups
                 SET record_count = ?, error_count = ?, bytes_total = ?,
                     latency_p50 = ?, latency_p95 = ?, latency_p99 = ?,
                     modified_at = to_timestamp(? / 1000000.0)
                 WHERE bucket = ? AND granularity = ? AND level = ?
                   AND service = ? AND log_type = ? AND enterprise_id = ?",
                duckdb::params![
                    metrics.count,
                    metrics.error_count,
                    metrics.bytes_total,
                    metrics.latency_p50,
                    metrics.latency_p95,
                    metrics.latency_p99,
                    Utc::now().timestamp_micros(),
                    key.bucket,
                    key.granularity.as_str(),
                    key.level,
                    key.service,
                    key.log_type,
                    key.enterprise_id,
                ],
            )?;

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn list_rollups(
        &self,
        granularity: Granularity,
        bucket: Option<&str>,
    ) -> Result<Vec<RollupRow>, StorageError> {
        let conn = self.conn.clone();
        let bucket = bucket.map(str::to_string);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            let mut rollups = Vec::new();
            match bucket {
                Some(bucket) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM rollups WHERE granularity = ? AND bucket = ?
                         ORDER BY bucket, level, service, log_type, enterprise_id",
                        ROLLUP_COLUMNS
                    ))?;
                    let rows = stmt.query_map(
                        duckdb::params![granularity.as_str(), bucket],
                        rollup_row_from,
                    )?;
                    for row in rows {
                        rollups.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM rollups WHERE granularity = ?
                         ORDER BY bucket, level, service, log_type, enterprise_id",
                        ROLLUP_COLUMNS
                    ))?;
                    let rows =
                        stmt.query_map(duckdb::params![granularity.as_str()], rollup_row_from)?;
                    for row in rows {
                        rollups.push(row?);
                    }
                }
            }
            Ok(rollups)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogLevel;
    use chrono::TimeZone;

    async fn setup() -> DuckDbStorage {
        let storage = DuckDbStorage::in_memory().unwrap();
        storage.init_schema().await.unwrap();
        storage
    }

    fn make_record(level: LogLevel, message: &str) -> LogRecord {
        let mut record = LogRecord::new(level, message);
        record.timestamp = Some(Utc.with_ymd_and_hms(2025, 7, 4, 15, 30, 0).unwrap());
        record
    }

    #[tokio::test]
    async fn test_probe_succeeds_after_schema_init() {
        let storage = setup().await;
        assert!(storage.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_fails_without_tables() {
        let storage = DuckDbStorage::in_memory().unwrap();
        assert!(storage.probe().await.is_err());
    }

    #[tokio::test]
    async fn test_insert_and_count_logs() {
        let storage = setup().await;

        storage
            .insert_log(&make_record(LogLevel::Info, "one"))
            .await
            .unwrap();
        storage
            .insert_log(&make_record(LogLevel::Error, "two"))
            .await
            .unwrap();

        let start = Utc.with_ymd_and_hms(2025, 7, 4, 15, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 7, 4, 16, 0, 0).unwrap();
        assert_eq!(storage.count_logs(start, end).await.unwrap(), 2);

        // Range is half-open.
        let late = Utc.with_ymd_and_hms(2025, 7, 4, 15, 30, 0).unwrap();
        assert_eq!(storage.count_logs(start, late).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_aggregate_groups_by_dimensions() {
        let storage = setup().await;

        for _ in 0..5 {
            storage
                .insert_log(&make_record(LogLevel::Error, "fail"))
                .await
                .unwrap();
        }
        let mut info = make_record(LogLevel::Info, "ok");
        info.service = Some("api".to_string());
        for _ in 0..3 {
            storage.insert_log(&info).await.unwrap();
        }

        let start = Utc.with_ymd_and_hms(2025, 7, 4, 15, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 7, 4, 16, 0, 0).unwrap();
        let groups = storage.aggregate_logs(start, end).await.unwrap();
        assert_eq!(groups.len(), 2);

        let errors = groups.iter().find(|g| g.level == "error").unwrap();
        assert_eq!(errors.count, 5);
        assert_eq!(errors.error_count, 5);
        assert_eq!(errors.service, "");

        let infos = groups.iter().find(|g| g.level == "info").unwrap();
        assert_eq!(infos.count, 3);
        assert_eq!(infos.error_count, 0);
        assert_eq!(infos.service, "api");
    }

    #[tokio::test]
    async fn test_aggregate_latency_percentiles() {
        let storage = setup().await;

        for latency in [10.0, 20.0, 30.0, 40.0] {
            let mut record = make_record(LogLevel::Info, "req");
            record.latency_ms = Some(latency);
            record.bytes_sent = Some(100);
            storage.insert_log(&record).await.unwrap();
        }

        let start = Utc.with_ymd_and_hms(2025, 7, 4, 15, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 7, 4, 16, 0, 0).unwrap();
        let groups = storage.aggregate_logs(start, end).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].bytes_total, 400);
        assert_eq!(groups[0].latency_p50, Some(25.0));
    }

    #[tokio::test]
    async fn test_rollup_find_insert_update() {
        let storage = setup().await;

        let key = RollupKey {
            bucket: "2025070415".to_string(),
            granularity: Granularity::Hour,
            level: "error".to_string(),
            service: String::new(),
            log_type: String::new(),
            enterprise_id: String::new(),
        };
        let metrics = RollupMetrics {
            count: 5,
            error_count: 5,
            bytes_total: 0,
            latency_p50: None,
            latency_p95: None,
            latency_p99: None,
        };

        assert!(storage.get_rollup(&key).await.unwrap().is_none());

        storage.insert_rollup(&key, &metrics).await.unwrap();
        let row = storage.get_rollup(&key).await.unwrap().unwrap();
        assert_eq!(row.metrics.count, 5);

        let updated = RollupMetrics { count: 7, ..metrics };
        storage.update_rollup(&key, &updated).await.unwrap();
        let row = storage.get_rollup(&key).await.unwrap().unwrap();
        assert_eq!(row.metrics.count, 7);

        let listed = storage
            .list_rollups(Granularity::Hour, Some("2025070415"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert!(storage
            .list_rollups(Granularity::Day, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_extra_stored_as_json_string() {
        let storage = setup().await;

        let mut record = make_record(LogLevel::Info, "payload");
        record.extra = Some(serde_json::json!({"request_id": "r-1"}));
        storage.insert_log(&record).await.unwrap();

        let conn = storage.conn.clone();
        let extra: String = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.prepare("SELECT extra FROM raw_logs")
                .unwrap()
                .query_row([], |row| row.get(0))
                .unwrap()
        })
        .await
        .unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&extra).unwrap();
        assert_eq!(parsed["request_id"], "r-1");
    }
}
