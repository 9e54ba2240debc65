use crate::record::{LogRecord, QueuedRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    pub count: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub byte_size: u64,
}

/// Bounded, file-persisted holding area for records that could not be
/// written directly to the backend.
///
/// The queue lives as a single JSON document; every mutation is a
/// whole-file read-modify-write. The mutex below serializes mutations from
/// this process. Concurrent writers from other processes would race
/// last-writer-wins on the file, which is why exactly one instance may own
/// a queue path.
pub struct OverflowQueue {
    path: PathBuf,
    max_entries: usize,
    max_bytes: usize,
    lock: Mutex<()>,
}

impl OverflowQueue {
    pub fn new(path: impl Into<PathBuf>, max_entries: usize, max_bytes: usize) -> Self {
        Self {
            path: path.into(),
            max_entries,
            max_bytes,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<QueuedRecord>, QueueError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(&self, records: &[QueuedRecord]) -> Result<(), QueueError> {
        let mut serialized = serde_json::to_vec(records)?;

        // Byte bound: keep only the newest half, by index.
        if serialized.len() > self.max_bytes {
            let keep_from = records.len() / 2;
            tracing::warn!(
                dropped = keep_from,
                retained = records.len() - keep_from,
                byte_size = serialized.len(),
                max_bytes = self.max_bytes,
                "Overflow queue exceeds byte limit, dropping oldest half"
            );
            serialized = serde_json::to_vec(&records[keep_from..])?;
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serialized).await?;
        Ok(())
    }

    pub async fn append(&self, record: LogRecord) -> Result<(), QueueError> {
        self.append_many(vec![record]).await
    }

    pub async fn append_many(&self, records: Vec<LogRecord>) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;

        let mut queued = self.load().await?;
        queued.extend(records.into_iter().map(QueuedRecord::wrap));

        // Entry bound: drop exactly the oldest overflow.
        if queued.len() > self.max_entries {
            let overflow = queued.len() - self.max_entries;
            queued.drain(..overflow);
            tracing::warn!(
                dropped = overflow,
                max_entries = self.max_entries,
                "Overflow queue full, dropping oldest entries"
            );
        }

        self.persist(&queued).await
    }

    pub async fn read_all(&self) -> Result<Vec<QueuedRecord>, QueueError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    pub async fn count(&self) -> Result<usize, QueueError> {
        Ok(self.read_all().await?.len())
    }

    pub async fn info(&self) -> Result<QueueInfo, QueueError> {
        let _guard = self.lock.lock().await;
        let queued = self.load().await?;
        let byte_size = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        Ok(QueueInfo {
            count: queued.len(),
            oldest: queued.first().map(|r| r.enqueued_at),
            newest: queued.last().map(|r| r.enqueued_at),
            byte_size,
        })
    }

    /// Replace the persisted queue wholesale. Used by reconciliation to
    /// shrink the file after each replayed batch.
    pub async fn replace(&self, records: &[QueuedRecord]) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        self.persist(records).await
    }

    pub async fn clear(&self) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, b"[]").await?;
        Ok(())
    }

    /// Copy the current queue file to a timestamped snapshot. Returns the
    /// snapshot path, or None when there is nothing to back up.
    pub async fn backup(&self) -> Result<Option<PathBuf>, QueueError> {
        let _guard = self.lock.lock().await;

        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(None);
        }

        let backup_path = self.path.with_extension(format!(
            "{}.bak",
            Utc::now().format("%Y%m%d%H%M%S")
        ));
        tokio::fs::copy(&self.path, &backup_path).await?;
        tracing::debug!(path = %backup_path.display(), "Backed up overflow queue");
        Ok(Some(backup_path))
    }
}
