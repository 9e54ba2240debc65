pub mod duckdb;
pub mod traits;

pub use traits::{RawAggregate, RollupKey, RollupMetrics, RollupRow, Storage, StorageError};
