pub mod aggregate;
pub mod bucket;
pub mod scheduler;

pub use bucket::{bucket_key, AggregationWindow, Granularity};
pub use scheduler::{AggregationScheduler, PassOutcome, SchedulerStatus};
