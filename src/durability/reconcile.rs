use crate::durability::queue::{OverflowQueue, QueueError};
use crate::storage::Storage;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Outcome of one drain pass. A pass that found the drain already running
/// reports all zeros.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    pub processed: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Replays the overflow queue into the backend in batches.
///
/// At most one drain runs at a time; callers that lose the race get an
/// empty report back instead of blocking. After each batch the queue file
/// is rewritten to hold only records not yet successfully replayed, so a
/// crash mid-drain loses nothing already delivered.
pub struct ReconciliationProcessor {
    storage: Arc<dyn Storage>,
    queue: Arc<OverflowQueue>,
    batch_size: usize,
    in_progress: AtomicBool,
}

impl ReconciliationProcessor {
    pub fn new(storage: Arc<dyn Storage>, queue: Arc<OverflowQueue>, batch_size: usize) -> Self {
        Self {
            storage,
            queue,
            batch_size: batch_size.max(1),
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub async fn drain(&self) -> Result<DrainReport, ReconcileError> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(DrainReport::default());
        }

        let result = self.drain_inner().await;
        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_inner(&self) -> Result<DrainReport, ReconcileError> {
        let pending = self.queue.read_all().await?;
        if pending.is_empty() {
            return Ok(DrainReport::default());
        }

        info!(count = pending.len(), "Draining overflow queue");
        self.queue.backup().await?;

        let mut report = DrainReport::default();
        let mut failed_records = Vec::new();
        let total = pending.len();
        let mut replayed = 0;

        for batch in pending.chunks(self.batch_size) {
            for queued in batch {
                let record = queued.clone().unwrap_record();
                match self.storage.insert_log(&record).await {
                    Ok(()) => report.processed += 1,
                    Err(e) => {
                        report.failed += 1;
                        report.errors.push(format!("{}: {}", queued.id, e));
                        failed_records.push(queued.clone());
                    }
                }
            }
            replayed += batch.len();

            // Everything not yet successfully replayed survives a crash:
            // failures so far plus the records we have not attempted.
            let mut remaining = failed_records.clone();
            remaining.extend_from_slice(&pending[replayed..]);
            self.queue.replace(&remaining).await?;
        }

        if report.failed == 0 {
            self.queue.clear().await?;
            info!(processed = report.processed, "Overflow queue drained");
        } else {
            warn!(
                processed = report.processed,
                failed = report.failed,
                total,
                "Overflow queue partially drained, failures retained for retry"
            );
        }

        Ok(report)
    }
}
