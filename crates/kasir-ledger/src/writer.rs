// ABOUTME: Verified key writes with bounded retries, linear backoff, and quota cleanup.
// ABOUTME: Each attempt probes the store, backs up the prior value, writes, and reads the value back.

use std::sync::Arc;
use std::time::Duration;

use kasir_core::keys;
use kasir_core::validation::{ValidationIssue, validate_document};
use kasir_store::{BackupManager, Diagnostics, ErrorKind, KvStore, StoreError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;

/// Snapshots older than this are swept when the store reports it is full.
const BACKUP_MAX_AGE_HOURS: i64 = 24;

/// Error-log entries older than this are purged during cleanup.
const ERROR_LOG_MAX_AGE_DAYS: i64 = 7;

/// How many times to try a write and how long to wait between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (1-based): `base_delay * attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Reasons a single write attempt can fail.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("closing record {index} is invalid: {summary}")]
    ValidationFailed {
        index: usize,
        summary: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("closing history must be a JSON list: {0}")]
    InvalidHistory(String),

    #[error("value could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("store availability probe failed: {0}")]
    ProbeFailed(StoreError),

    #[error("store rejected the write: {0}")]
    Store(#[from] StoreError),

    #[error("read-back of {key} did not match the written value")]
    VerificationFailed { key: String },
}

impl WriteError {
    /// Validation and encoding problems are deterministic and never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            WriteError::ValidationFailed { .. }
                | WriteError::InvalidHistory(_)
                | WriteError::Serialize(_)
        )
    }

    pub fn is_quota(&self) -> bool {
        match self {
            WriteError::ProbeFailed(e) | WriteError::Store(e) => e.is_quota(),
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WriteError::ValidationFailed { .. }
            | WriteError::InvalidHistory(_)
            | WriteError::Serialize(_) => ErrorKind::ValidationFailed,
            WriteError::VerificationFailed { .. } => ErrorKind::VerificationFailed,
            e if e.is_quota() => ErrorKind::QuotaExceeded,
            _ => ErrorKind::WriteFailed,
        }
    }
}

/// A write that did not succeed within the retry budget.
#[derive(Debug, Error)]
#[error("write to {key} failed after {attempts} attempt(s): {source}")]
pub struct WriteFailure {
    pub key: String,
    pub attempts: u32,
    pub source: WriteError,
}

/// A read that could not produce a value.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not read {key}: {source}")]
    Store { key: String, source: StoreError },

    #[error("{key} does not hold the expected document: {source}")]
    Corrupt { key: String, source: serde_json::Error },
}

impl LoadError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, LoadError::Corrupt { .. })
    }
}

/// A write that succeeded, and how many attempts it took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    pub attempts: u32,
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub backups_removed: usize,
    pub errors_purged: usize,
}

/// Writes values with validation, verification, and retries.
#[derive(Clone)]
pub struct RetryingWriter {
    store: Arc<dyn KvStore>,
    backups: BackupManager,
    diagnostics: Arc<Diagnostics>,
    policy: RetryPolicy,
}

impl RetryingWriter {
    pub fn new(
        store: Arc<dyn KvStore>,
        backups: BackupManager,
        diagnostics: Arc<Diagnostics>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            backups,
            diagnostics,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Write `value` to `key`, retrying transient failures.
    ///
    /// Writes to the closing history are validated record by record first; a
    /// validation failure returns immediately after one attempt.
    pub async fn save_with_retry(&self, key: &str, value: &str) -> Result<WriteReceipt, WriteFailure> {
        if key == keys::CLOSING_HISTORY
            && let Err(e) = validate_history(value)
        {
            self.diagnostics
                .log_error(e.kind(), &e, json!({ "key": key, "attempt": 1 }));
            return Err(WriteFailure {
                key: key.to_owned(),
                attempts: 1,
                source: e,
            });
        }

        let mut attempt = 1;
        loop {
            match self.attempt_write(key, value) {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(key, attempt, "write succeeded after retry");
                    }
                    return Ok(WriteReceipt { attempts: attempt });
                }
                Err(e) => {
                    self.diagnostics
                        .log_error(e.kind(), &e, json!({ "key": key, "attempt": attempt }));

                    if attempt >= self.policy.max_attempts {
                        return Err(WriteFailure {
                            key: key.to_owned(),
                            attempts: attempt,
                            source: e,
                        });
                    }

                    if e.is_quota() {
                        let report = self.run_cleanup();
                        tracing::warn!(
                            key,
                            backups_removed = report.backups_removed,
                            errors_purged = report.errors_purged,
                            "store full, cleaned up before retrying"
                        );
                    }

                    let delay = self.policy.delay_for(attempt);
                    tracing::debug!(key, attempt, ?delay, "retrying write");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Serialize `value` as JSON and write it with retries.
    pub async fn save_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<WriteReceipt, WriteFailure> {
        let encoded = serde_json::to_string(value).map_err(|e| WriteFailure {
            key: key.to_owned(),
            attempts: 0,
            source: WriteError::Serialize(e),
        })?;
        self.save_with_retry(key, &encoded).await
    }

    /// Read and decode `key`. A missing key is `Ok(None)`; a store failure
    /// and an undecodable value are distinct errors.
    pub fn try_load_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, LoadError> {
        let raw = self.store.get(key).map_err(|source| LoadError::Store {
            key: key.to_owned(),
            source,
        })?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| LoadError::Corrupt {
                key: key.to_owned(),
                source,
            })
    }

    /// Read and decode `key` for display. Missing, unreadable, or undecodable
    /// values are reported as None.
    pub fn load_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.try_load_json(key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, "ignoring value: {}", e);
                None
            }
        }
    }

    /// Free space: drop expired backups and purge old error-log entries.
    pub fn run_cleanup(&self) -> CleanupReport {
        let backups_removed = match self
            .backups
            .clean_expired(chrono::Duration::hours(BACKUP_MAX_AGE_HOURS))
        {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("backup cleanup failed: {}", e);
                0
            }
        };
        let errors_purged = self
            .diagnostics
            .purge_errors_older_than(chrono::Duration::days(ERROR_LOG_MAX_AGE_DAYS));
        CleanupReport {
            backups_removed,
            errors_purged,
        }
    }

    fn attempt_write(&self, key: &str, value: &str) -> Result<(), WriteError> {
        self.store
            .set(keys::PROBE, "1")
            .map_err(WriteError::ProbeFailed)?;
        self.store.remove(keys::PROBE).map_err(WriteError::ProbeFailed)?;

        if let Some(previous) = self.store.get(key)? {
            self.backups.create_backup(key, &previous);
        }

        self.store.set(key, value)?;

        match self.store.get(key)? {
            Some(stored) if stored == value => Ok(()),
            _ => Err(WriteError::VerificationFailed { key: key.to_owned() }),
        }
    }
}

/// Every element of a closing-history value must be a valid closing record.
fn validate_history(value: &str) -> Result<(), WriteError> {
    let doc: Value = serde_json::from_str(value).map_err(|e| WriteError::InvalidHistory(e.to_string()))?;
    let Some(records) = doc.as_array() else {
        return Err(WriteError::InvalidHistory("not an array".to_string()));
    };
    for (index, record) in records.iter().enumerate() {
        let report = validate_document(record);
        if !report.is_valid() {
            return Err(WriteError::ValidationFailed {
                index,
                summary: report.summary(),
                issues: report.errors,
            });
        }
    }
    Ok(())
}
