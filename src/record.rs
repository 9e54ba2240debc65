use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Severity of an ingested record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ValidationError::InvalidLevel(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid log level: {0}")]
    InvalidLevel(String),
}

/// One ingested log/event record.
///
/// `message` and `level` are required; everything else is an optional
/// dimension or request-style metric. `extra` stays structured in memory
/// and is only flattened to a string at the storage boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub message: String,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_sent: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level,
            timestamp: None,
            service: None,
            log_type: None,
            enterprise_id: None,
            app_id: None,
            user_id: None,
            latency_ms: None,
            bytes_sent: None,
            extra: None,
        }
    }

    /// Rejects records that must never reach the queue or the backend.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.message.trim().is_empty() {
            return Err(ValidationError::MissingField("message"));
        }
        Ok(())
    }

    /// If `extra` arrived as a JSON-encoded string (as happens when records
    /// round-trip through the overflow queue or an older producer), parse it
    /// back into structure. Leaves the value alone when parsing fails.
    pub fn reparse_extra(&mut self) {
        if let Some(serde_json::Value::String(s)) = &self.extra {
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(s) {
                if parsed.is_object() || parsed.is_array() {
                    self.extra = Some(parsed);
                }
            }
        }
    }
}

/// A log record wrapped with its overflow-queue envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRecord {
    pub id: Uuid,
    pub enqueued_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: LogRecord,
}

impl QueuedRecord {
    pub fn wrap(record: LogRecord) -> Self {
        Self {
            id: Uuid::new_v4(),
            enqueued_at: Utc::now(),
            record,
        }
    }

    /// Strip the envelope for replay into the backend.
    pub fn unwrap_record(self) -> LogRecord {
        let mut record = self.record;
        record.reparse_extra();
        record
    }
}

/// What happened to a record on the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    /// Durably written to the backend.
    pub stored: bool,
    /// Held in the overflow queue pending reconciliation.
    pub cached: bool,
}

impl WriteOutcome {
    pub fn stored() -> Self {
        Self {
            stored: true,
            cached: false,
        }
    }

    pub fn cached() -> Self {
        Self {
            stored: false,
            cached: true,
        }
    }
}
