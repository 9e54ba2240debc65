use crate::rollup::bucket::{AggregationWindow, Granularity};
use crate::storage::{RollupKey, RollupMetrics, Storage, StorageError};
use std::sync::Arc;
use tracing::debug;

/// Recompute every rollup row for one bucket from the raw store and write
/// each row whole. Re-running a pass over the same window converges on the
/// same values instead of double counting.
pub async fn run_pass(
    storage: &Arc<dyn Storage>,
    granularity: Granularity,
    window: &AggregationWindow,
) -> Result<usize, StorageError> {
    let groups = storage.aggregate_logs(window.start, window.end).await?;

    let mut written = 0;
    for group in groups {
        let key = RollupKey {
            bucket: window.bucket.clone(),
            granularity,
            level: group.level,
            service: group.service,
            log_type: group.log_type,
            enterprise_id: group.enterprise_id,
        };
        let metrics = RollupMetrics {
            count: group.count,
            error_count: group.error_count,
            bytes_total: group.bytes_total,
            latency_p50: group.latency_p50,
            latency_p95: group.latency_p95,
            latency_p99: group.latency_p99,
        };

        // Find then update-or-insert; the metrics replace the row wholesale.
        match storage.get_rollup(&key).await? {
            Some(_) => storage.update_rollup(&key, &metrics).await?,
            None => storage.insert_rollup(&key, &metrics).await?,
        }
        written += 1;
    }

    debug!(
        granularity = %granularity,
        bucket = %window.bucket,
        rows = written,
        "Aggregation pass complete"
    );
    Ok(written)
}
