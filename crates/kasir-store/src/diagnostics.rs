// ABOUTME: Bounded in-process error and operation logs with a derived health status.
// ABOUTME: Every entry is mirrored to tracing; the logs themselves are not persisted.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::KvStore;

/// Maximum entries kept in each log before the oldest is evicted.
pub const LOG_CAPACITY: usize = 100;

/// More errors than this in the last hour marks the system unhealthy.
pub const UNHEALTHY_ERROR_THRESHOLD: usize = 10;

/// Failure categories recorded in the error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationFailed,
    WriteFailed,
    QuotaExceeded,
    VerificationFailed,
    TransactionFailed,
    RollbackFailed,
    JournalPostingFailed,
    BackupFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::WriteFailed => "write_failed",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::VerificationFailed => "verification_failed",
            ErrorKind::TransactionFailed => "transaction_failed",
            ErrorKind::RollbackFailed => "rollback_failed",
            ErrorKind::JournalPostingFailed => "journal_posting_failed",
            ErrorKind::BackupFailed => "backup_failed",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Committed,
    RolledBack,
    RollbackFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationEntry {
    pub timestamp: DateTime<Utc>,
    pub operation_id: String,
    pub status: OperationStatus,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy,
}

/// Aggregate store usage against the assumed quota.
#[derive(Debug, Clone, Serialize)]
pub struct StorageUsage {
    pub used_bytes: usize,
    pub quota_bytes: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: Health,
    pub errors_last_hour: usize,
    pub last_backup: Option<DateTime<Utc>>,
    /// None when the store could not be enumerated.
    pub storage: Option<StorageUsage>,
}

/// Process-wide diagnostic state. Construct once at startup and share via `Arc`.
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Mutex<VecDeque<ErrorEntry>>,
    operations: Mutex<VecDeque<OperationEntry>>,
    last_backup: Mutex<Option<DateTime<Utc>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding a log lock leaves the log usable; keep going.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure now.
    pub fn log_error(&self, kind: ErrorKind, error: &dyn Display, context: serde_json::Value) {
        self.log_error_at(kind, error, context, Utc::now());
    }

    /// Record a failure with an explicit timestamp.
    pub fn log_error_at(
        &self,
        kind: ErrorKind,
        error: &dyn Display,
        context: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) {
        let message = error.to_string();
        tracing::error!(kind = %kind, context = %context, "{}", message);

        let mut errors = lock(&self.errors);
        errors.push_back(ErrorEntry {
            timestamp,
            kind,
            message,
            context,
        });
        while errors.len() > LOG_CAPACITY {
            errors.pop_front();
        }
    }

    /// Record the outcome of a transaction.
    pub fn log_operation(&self, operation_id: &str, status: OperationStatus, duration: Duration) {
        match status {
            OperationStatus::Committed => {
                tracing::info!(operation_id, ?duration, "operation committed")
            }
            OperationStatus::RolledBack => {
                tracing::warn!(operation_id, ?duration, "operation rolled back")
            }
            OperationStatus::RollbackFailed => {
                tracing::error!(operation_id, ?duration, "operation rollback failed")
            }
        }

        let mut operations = lock(&self.operations);
        operations.push_back(OperationEntry {
            timestamp: Utc::now(),
            operation_id: operation_id.to_owned(),
            status,
            duration_ms: duration.as_millis(),
        });
        while operations.len() > LOG_CAPACITY {
            operations.pop_front();
        }
    }

    pub fn record_backup(&self, at: DateTime<Utc>) {
        let mut last = lock(&self.last_backup);
        if last.is_none_or(|prev| at > prev) {
            *last = Some(at);
        }
    }

    pub fn last_backup(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_backup)
    }

    pub fn recent_errors(&self) -> Vec<ErrorEntry> {
        lock(&self.errors).iter().cloned().collect()
    }

    pub fn recent_operations(&self) -> Vec<OperationEntry> {
        lock(&self.operations).iter().cloned().collect()
    }

    pub fn errors_since(&self, since: DateTime<Utc>) -> usize {
        lock(&self.errors)
            .iter()
            .filter(|e| e.timestamp >= since)
            .count()
    }

    /// Drop error entries older than `max_age`. Returns how many were removed.
    pub fn purge_errors_older_than(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut errors = lock(&self.errors);
        let before = errors.len();
        errors.retain(|e| e.timestamp >= cutoff);
        before - errors.len()
    }

    /// Summarize recent error volume, backup recency, and store usage.
    pub fn health_status(&self, store: &dyn KvStore, quota_bytes: usize) -> HealthStatus {
        let errors_last_hour = self.errors_since(Utc::now() - chrono::Duration::hours(1));
        let status = if errors_last_hour > UNHEALTHY_ERROR_THRESHOLD {
            Health::Unhealthy
        } else {
            Health::Healthy
        };

        let storage = match store.usage_bytes() {
            Ok(used_bytes) => Some(StorageUsage {
                used_bytes,
                quota_bytes,
                percent: if quota_bytes == 0 {
                    100.0
                } else {
                    used_bytes as f64 / quota_bytes as f64 * 100.0
                },
            }),
            Err(e) => {
                tracing::warn!("could not measure store usage: {}", e);
                None
            }
        };

        HealthStatus {
            status,
            errors_last_hour,
            last_backup: self.last_backup(),
            storage,
        }
    }
}
