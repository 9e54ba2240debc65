use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub durability: DurabilityConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    pub web: WebConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the DuckDB database file.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurabilityConfig {
    /// Path of the overflow queue file (a single JSON document).
    pub queue_path: PathBuf,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_probe_interval_seconds")]
    pub probe_interval_seconds: u64,
    #[serde(default = "default_reconcile_batch_size")]
    pub reconcile_batch_size: usize,
}

fn default_max_entries() -> usize {
    10_000
}

fn default_max_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_probe_interval_seconds() -> u64 {
    30
}

fn default_reconcile_batch_size() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Minute offset past the hour at which the hourly tick fires.
    #[serde(default)]
    pub hourly_offset_minutes: u32,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            hourly_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub listen: String,
}

impl Config {
    /// A commented-out starting point written by `logtide config init`.
    pub fn sample_yaml() -> &'static str {
        r#"# logtide configuration
#
# Exactly one logtide instance should run against a given database and
# queue file; nothing coordinates concurrent instances.

storage:
  # DuckDB database file holding raw logs and rollups.
  path: ~/.local/share/logtide/logtide.duckdb

durability:
  # Overflow queue file used while the backend is unreachable.
  queue_path: ~/.local/share/logtide/overflow-queue.json
  # Oldest entries are dropped once the queue exceeds these bounds.
  max_entries: 10000
  max_bytes: 52428800
  # Backend health probe cadence.
  probe_interval_seconds: 30
  # Records replayed per reconciliation batch.
  reconcile_batch_size: 100

aggregation:
  # Minute past the hour at which rollup passes fire.
  hourly_offset_minutes: 0

web:
  listen: 127.0.0.1:8460
"#
    }
}
