//! End-to-end coverage of the write path: direct writes, failover to the
//! overflow queue, reconciliation after recovery, and rollups over the
//! reconciled data.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use logtide::durability::{
    HealthMonitor, IngestError, IngestionCoordinator, OverflowQueue, ReconciliationProcessor,
};
use logtide::record::{LogLevel, LogRecord};
use logtide::rollup::bucket::{self, Granularity};
use logtide::rollup::AggregationScheduler;
use logtide::storage::duckdb::DuckDbStorage;
use logtide::storage::{
    RawAggregate, RollupKey, RollupMetrics, RollupRow, Storage, StorageError,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// DuckDB-backed storage with a kill switch on the write path, standing in
/// for a backend that goes down and comes back. Individual records can also
/// be rejected by message, simulating per-record write failures while the
/// backend is otherwise up.
struct FlakyStorage {
    inner: DuckDbStorage,
    healthy: AtomicBool,
    rejected: Mutex<HashSet<String>>,
}

impl FlakyStorage {
    fn new() -> Self {
        let inner = DuckDbStorage::in_memory().unwrap();
        Self {
            inner,
            healthy: AtomicBool::new(true),
            rejected: Mutex::new(HashSet::new()),
        }
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn reject_message(&self, message: &str) {
        self.rejected.lock().unwrap().insert(message.to_string());
    }

    fn allow_message(&self, message: &str) {
        self.rejected.lock().unwrap().remove(message);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Database("backend unavailable".to_string()))
        }
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        self.inner.init_schema().await
    }

    async fn probe(&self) -> Result<(), StorageError> {
        self.check()?;
        self.inner.probe().await
    }

    async fn insert_log(&self, record: &LogRecord) -> Result<(), StorageError> {
        self.check()?;
        if self.rejected.lock().unwrap().contains(&record.message) {
            return Err(StorageError::Database(format!(
                "constraint violation: {}",
                record.message
            )));
        }
        self.inner.insert_log(record).await
    }

    async fn count_logs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        self.inner.count_logs(start, end).await
    }

    async fn aggregate_logs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawAggregate>, StorageError> {
        self.inner.aggregate_logs(start, end).await
    }

    async fn get_rollup(&self, key: &RollupKey) -> Result<Option<RollupRow>, StorageError> {
        self.inner.get_rollup(key).await
    }

    async fn insert_rollup(
        &self,
        key: &RollupKey,
        metrics: &RollupMetrics,
    ) -> Result<(), StorageError> {
        self.inner.insert_rollup(key, metrics).await
    }

    async fn update_rollup(
        &self,
        key: &RollupKey,
        metrics: &RollupMetrics,
    ) -> Result<(), StorageError> {
        self.inner.update_rollup(key, metrics).await
    }

    async fn list_rollups(
        &self,
        granularity: Granularity,
        bucket: Option<&str>,
    ) -> Result<Vec<RollupRow>, StorageError> {
        self.inner.list_rollups(granularity, bucket).await
    }
}

struct Harness {
    storage: Arc<FlakyStorage>,
    queue: Arc<OverflowQueue>,
    health: Arc<HealthMonitor>,
    reconciler: Arc<ReconciliationProcessor>,
    coordinator: IngestionCoordinator,
    _dir: tempfile::TempDir,
}

async fn make_harness(max_entries: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FlakyStorage::new());
    storage.init_schema().await.unwrap();

    let queue = Arc::new(OverflowQueue::new(
        dir.path().join("overflow.json"),
        max_entries,
        50 * 1024 * 1024,
    ));
    let trait_storage: Arc<dyn Storage> = storage.clone();
    let reconciler = Arc::new(ReconciliationProcessor::new(
        trait_storage.clone(),
        queue.clone(),
        100,
    ));
    let health = Arc::new(HealthMonitor::new(trait_storage.clone(), 5));
    let coordinator = IngestionCoordinator::new(
        trait_storage,
        queue.clone(),
        health.clone(),
        reconciler.clone(),
    );

    Harness {
        storage,
        queue,
        health,
        reconciler,
        coordinator,
        _dir: dir,
    }
}

fn record_at(level: LogLevel, message: &str, hour: u32, minute: u32) -> LogRecord {
    let mut record = LogRecord::new(level, message);
    record.timestamp = Some(Utc.with_ymd_and_hms(2025, 7, 4, hour, minute, 0).unwrap());
    record.service = Some("api".to_string());
    record
}

fn all_time() -> (DateTime<Utc>, DateTime<Utc>) {
    (
        Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap(),
    )
}

#[tokio::test]
async fn healthy_writes_go_straight_to_storage() {
    let harness = make_harness(1000).await;

    let outcome = harness
        .coordinator
        .write(record_at(LogLevel::Info, "direct", 10, 0))
        .await
        .unwrap();
    assert!(outcome.stored);
    assert!(!outcome.cached);

    let (start, end) = all_time();
    assert_eq!(harness.storage.count_logs(start, end).await.unwrap(), 1);
    assert_eq!(harness.queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn outage_caches_writes_and_recovery_drains_them() {
    let harness = make_harness(1000).await;

    harness.storage.set_healthy(false);
    harness.health.check_now().await;
    assert!(!harness.health.is_healthy().await);

    for i in 0..3 {
        let outcome = harness
            .coordinator
            .write(record_at(LogLevel::Warn, &format!("cached-{}", i), 11, i))
            .await
            .unwrap();
        assert!(outcome.cached);
    }
    assert_eq!(harness.queue.count().await.unwrap(), 3);

    let (start, end) = all_time();
    assert_eq!(harness.storage.count_logs(start, end).await.unwrap(), 0);

    harness.storage.set_healthy(true);
    harness.health.check_now().await;
    assert!(harness.health.is_healthy().await);

    let report = harness.reconciler.drain().await.unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(harness.queue.count().await.unwrap(), 0);
    assert_eq!(harness.storage.count_logs(start, end).await.unwrap(), 3);
}

#[tokio::test]
async fn direct_write_failure_falls_back_to_queue() {
    let harness = make_harness(1000).await;

    // Health still says up, but the write itself fails.
    harness.storage.set_healthy(false);
    let outcome = harness
        .coordinator
        .write(record_at(LogLevel::Error, "lost backend mid-flight", 12, 0))
        .await
        .unwrap();
    assert!(outcome.cached);
    assert_eq!(harness.queue.count().await.unwrap(), 1);
}

#[tokio::test]
async fn partial_drain_retains_only_the_failed_records() {
    let harness = make_harness(1000).await;

    harness.storage.set_healthy(false);
    harness.health.check_now().await;
    for i in 0..4 {
        harness
            .coordinator
            .write(record_at(LogLevel::Info, &format!("replay-{}", i), 14, i))
            .await
            .unwrap();
    }

    harness.storage.set_healthy(true);
    harness.health.check_now().await;
    harness.storage.reject_message("replay-1");

    // Batch size 2 so the queue file shrinks batch by batch mid-drain.
    let trait_storage: Arc<dyn Storage> = harness.storage.clone();
    let reconciler = ReconciliationProcessor::new(trait_storage, harness.queue.clone(), 2);

    let report = reconciler.drain().await.unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("constraint violation"));

    // Only the failed record survives, queued for the next drain.
    let retained = harness.queue.read_all().await.unwrap();
    assert_eq!(retained.len(), 1);
    assert_eq!(retained[0].record.message, "replay-1");

    let (start, end) = all_time();
    assert_eq!(harness.storage.count_logs(start, end).await.unwrap(), 3);

    // Once the backend accepts it, the next drain delivers it and clears.
    harness.storage.allow_message("replay-1");
    let report = reconciler.drain().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(harness.queue.count().await.unwrap(), 0);
    assert_eq!(harness.storage.count_logs(start, end).await.unwrap(), 4);
}

#[tokio::test]
async fn queue_write_failure_propagates_to_the_caller() {
    let dir = tempfile::tempdir().unwrap();

    // The queue path's parent is a regular file, so persisting can never work.
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"").unwrap();

    let storage = Arc::new(FlakyStorage::new());
    storage.init_schema().await.unwrap();
    let queue = Arc::new(OverflowQueue::new(
        blocker.join("overflow.json"),
        100,
        1 << 20,
    ));
    let trait_storage: Arc<dyn Storage> = storage.clone();
    let reconciler = Arc::new(ReconciliationProcessor::new(
        trait_storage.clone(),
        queue.clone(),
        100,
    ));
    let health = Arc::new(HealthMonitor::new(trait_storage.clone(), 5));
    let coordinator =
        IngestionCoordinator::new(trait_storage, queue, health.clone(), reconciler);

    // Unhealthy backend routes to the queue, which cannot be written either.
    storage.set_healthy(false);
    health.check_now().await;
    let result = coordinator
        .write(record_at(LogLevel::Info, "nowhere to go", 16, 0))
        .await;
    assert!(matches!(result, Err(IngestError::Queue(_))));

    // Same outcome when the direct write fails while health still reads up.
    storage.set_healthy(true);
    health.check_now().await;
    storage.reject_message("still nowhere");
    let result = coordinator
        .write(record_at(LogLevel::Info, "still nowhere", 16, 1))
        .await;
    assert!(matches!(result, Err(IngestError::Queue(_))));
}

#[tokio::test]
async fn queue_eviction_keeps_the_newest_records() {
    let harness = make_harness(5).await;

    harness.storage.set_healthy(false);
    harness.health.check_now().await;

    for i in 0..8 {
        harness
            .coordinator
            .write(record_at(LogLevel::Info, &format!("burst-{}", i), 13, i))
            .await
            .unwrap();
    }

    let queued = harness.queue.read_all().await.unwrap();
    assert_eq!(queued.len(), 5);
    assert_eq!(queued[0].record.message, "burst-3");
    assert_eq!(queued[4].record.message, "burst-7");
}

#[tokio::test]
async fn invalid_records_are_rejected_not_queued() {
    let harness = make_harness(1000).await;

    harness.storage.set_healthy(false);
    harness.health.check_now().await;

    let result = harness
        .coordinator
        .write(LogRecord::new(LogLevel::Info, "   "))
        .await;
    assert!(result.is_err());
    assert_eq!(harness.queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn reconciled_records_feed_hourly_rollups() {
    let harness = make_harness(1000).await;

    harness.storage.set_healthy(false);
    harness.health.check_now().await;

    for i in 0..5 {
        harness
            .coordinator
            .write(record_at(LogLevel::Error, &format!("err-{}", i), 15, i))
            .await
            .unwrap();
    }
    for i in 0..3 {
        harness
            .coordinator
            .write(record_at(LogLevel::Info, &format!("ok-{}", i), 15, 30 + i))
            .await
            .unwrap();
    }

    harness.storage.set_healthy(true);
    harness.health.check_now().await;
    let report = harness.reconciler.drain().await.unwrap();
    assert_eq!(report.processed, 8);

    let trait_storage: Arc<dyn Storage> = harness.storage.clone();
    let now = Utc.with_ymd_and_hms(2025, 7, 4, 16, 0, 30).unwrap();
    let window = bucket::previous_closed_window(Granularity::Hour, now);
    logtide::rollup::aggregate::run_pass(&trait_storage, Granularity::Hour, &window)
        .await
        .unwrap();

    // Re-running the pass converges instead of double counting.
    logtide::rollup::aggregate::run_pass(&trait_storage, Granularity::Hour, &window)
        .await
        .unwrap();

    let rows = harness
        .storage
        .list_rollups(Granularity::Hour, Some("2025070415"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    let errors = rows.iter().find(|r| r.key.level == "error").unwrap();
    assert_eq!(errors.metrics.count, 5);
    assert_eq!(errors.metrics.error_count, 5);
    assert_eq!(errors.key.service, "api");

    let infos = rows.iter().find(|r| r.key.level == "info").unwrap();
    assert_eq!(infos.metrics.count, 3);
    assert_eq!(infos.metrics.error_count, 0);
}

#[tokio::test]
async fn manual_update_covers_every_granularity() {
    let harness = make_harness(1000).await;

    // A moment safely inside the open hour, so every capped window covers it.
    let at = Utc::now() - chrono::Duration::seconds(2);
    let mut record = LogRecord::new(LogLevel::Info, "fresh");
    record.timestamp = Some(at);
    harness.coordinator.write(record).await.unwrap();

    let trait_storage: Arc<dyn Storage> = harness.storage.clone();
    let scheduler = AggregationScheduler::new(trait_storage, 0);
    let outcomes = scheduler.manual_update(None, Some(at)).await.unwrap();

    assert_eq!(outcomes.len(), 4);
    for outcome in &outcomes {
        assert_eq!(outcome.rows, 1, "granularity {}", outcome.granularity);
    }
    assert_eq!(outcomes[0].bucket, bucket::bucket_key(Granularity::Hour, at));
}

#[tokio::test]
async fn records_survive_a_process_restart_in_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("overflow.json");

    {
        let queue = OverflowQueue::new(&path, 100, 1 << 20);
        queue
            .append(LogRecord::new(LogLevel::Error, "persisted"))
            .await
            .unwrap();
    }

    // A fresh instance over the same file sees the backlog.
    let queue = Arc::new(OverflowQueue::new(&path, 100, 1 << 20));
    assert_eq!(queue.count().await.unwrap(), 1);

    let storage = Arc::new(FlakyStorage::new());
    storage.init_schema().await.unwrap();
    let trait_storage: Arc<dyn Storage> = storage.clone();
    let reconciler = ReconciliationProcessor::new(trait_storage, queue.clone(), 10);

    let report = reconciler.drain().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(queue.count().await.unwrap(), 0);

    let (start, end) = all_time();
    assert_eq!(storage.count_logs(start, end).await.unwrap(), 1);
}
