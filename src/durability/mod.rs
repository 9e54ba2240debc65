pub mod coordinator;
pub mod health;
pub mod queue;
pub mod reconcile;

pub use coordinator::{IngestError, IngestionCoordinator};
pub use health::{HealthMonitor, HealthState};
pub use queue::{OverflowQueue, QueueError, QueueInfo};
pub use reconcile::{DrainReport, ReconcileError, ReconciliationProcessor};
