use crate::durability::health::HealthMonitor;
use crate::durability::queue::{OverflowQueue, QueueError};
use crate::durability::reconcile::ReconciliationProcessor;
use crate::record::{LogRecord, ValidationError, WriteOutcome};
use crate::storage::Storage;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Front door of the write path. Routes each record either straight to the
/// backend or into the overflow queue, based on health state and on whether
/// the direct write itself fails.
pub struct IngestionCoordinator {
    storage: Arc<dyn Storage>,
    queue: Arc<OverflowQueue>,
    health: Arc<HealthMonitor>,
    reconciler: Arc<ReconciliationProcessor>,
}

impl IngestionCoordinator {
    pub fn new(
        storage: Arc<dyn Storage>,
        queue: Arc<OverflowQueue>,
        health: Arc<HealthMonitor>,
        reconciler: Arc<ReconciliationProcessor>,
    ) -> Self {
        Self {
            storage,
            queue,
            health,
            reconciler,
        }
    }

    /// Accept one record. Invalid records are rejected outright and never
    /// queued. A queue write failure is the only fatal path: at that point
    /// the record has nowhere durable to go.
    pub async fn write(&self, mut record: LogRecord) -> Result<WriteOutcome, IngestError> {
        record.validate()?;

        if record.timestamp.is_none() {
            record.timestamp = Some(Utc::now());
        }

        if !self.health.is_healthy().await {
            debug!("Backend marked unhealthy, caching record");
            self.queue.append(record).await?;
            return Ok(WriteOutcome::cached());
        }

        match self.storage.insert_log(&record).await {
            Ok(()) => {
                self.maybe_reconcile();
                Ok(WriteOutcome::stored())
            }
            Err(e) => {
                warn!(error = %e, "Direct write failed, caching record");
                self.queue.append(record).await?;
                Ok(WriteOutcome::cached())
            }
        }
    }

    /// After a successful direct write the backend is demonstrably up, so
    /// any backlog can be replayed. Fire and forget; the drain's own
    /// single-flight guard handles overlap.
    fn maybe_reconcile(&self) {
        let queue = Arc::clone(&self.queue);
        let reconciler = Arc::clone(&self.reconciler);
        tokio::spawn(async move {
            match queue.count().await {
                Ok(0) => {}
                Ok(n) => {
                    debug!(pending = n, "Opportunistic reconciliation");
                    if let Err(e) = reconciler.drain().await {
                        warn!(error = %e, "Opportunistic reconciliation failed");
                    }
                }
                Err(e) => warn!(error = %e, "Could not read overflow queue size"),
            }
        });
    }
}
