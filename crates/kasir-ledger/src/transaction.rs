// ABOUTME: Multi-key atomic commits emulated over single-key stores via snapshot and rollback.
// ABOUTME: Runs an operation under a deadline and restores every tracked key if it fails or times out.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kasir_core::keys;
use kasir_core::validation::ValidationReport;
use kasir_store::{BackupManager, Diagnostics, ErrorKind, KvStore, OperationStatus, StoreError};
use serde_json::json;
use thiserror::Error;
use ulid::Ulid;

use crate::accounting::AccountingError;
use crate::writer::{LoadError, WriteFailure};

/// Which store a tracked key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreScope {
    Persistent,
    Session,
}

/// A key whose value is captured before an operation and restored on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedKey {
    pub scope: StoreScope,
    pub key: String,
}

impl TrackedKey {
    pub fn persistent(key: &str) -> Self {
        Self {
            scope: StoreScope::Persistent,
            key: key.to_owned(),
        }
    }

    pub fn session(key: &str) -> Self {
        Self {
            scope: StoreScope::Session,
            key: key.to_owned(),
        }
    }
}

/// The keys a cash closing touches: history, session, and running balance.
pub fn closing_tracked_keys() -> Vec<TrackedKey> {
    vec![
        TrackedKey::persistent(keys::CLOSING_HISTORY),
        TrackedKey::session(keys::CASH_SESSION),
        TrackedKey::persistent(keys::CASH_BALANCE),
    ]
}

/// Reasons a transaction did not commit.
#[derive(Debug, Error)]
pub enum TxError {
    #[error("closing record rejected: {0}")]
    Validation(ValidationReport),

    #[error(transparent)]
    Write(#[from] WriteFailure),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Accounting(#[from] AccountingError),

    #[error("{0}")]
    Aborted(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("could not capture {key} before the operation: {source}")]
    SnapshotFailed { key: String, source: StoreError },

    #[error("rollback failed ({rollback}) while undoing: {original}")]
    RollbackFailed {
        original: Box<TxError>,
        rollback: StoreError,
    },
}

/// Outcome of one executor run.
#[derive(Debug)]
pub struct TxReport<T> {
    pub operation_id: Ulid,
    pub duration: Duration,
    pub outcome: Result<T, TxError>,
}

impl<T> TxReport<T> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

struct Snapshot {
    tracked: TrackedKey,
    value: Option<String>,
}

/// Runs operations so that either all of their writes to tracked keys stand,
/// or none do. This is the only place multi-key atomicity is enforced; tracked
/// keys must not be written outside an operation passed to [`run`](Self::run).
#[derive(Clone)]
pub struct TransactionExecutor {
    persistent: Arc<dyn KvStore>,
    session: Arc<dyn KvStore>,
    backups: BackupManager,
    diagnostics: Arc<Diagnostics>,
    tracked: Vec<TrackedKey>,
    timeout: Duration,
}

impl TransactionExecutor {
    pub fn new(
        persistent: Arc<dyn KvStore>,
        session: Arc<dyn KvStore>,
        backups: BackupManager,
        diagnostics: Arc<Diagnostics>,
        timeout: Duration,
    ) -> Self {
        Self {
            persistent,
            session,
            backups,
            diagnostics,
            tracked: closing_tracked_keys(),
            timeout,
        }
    }

    pub fn with_tracked_keys(mut self, tracked: Vec<TrackedKey>) -> Self {
        self.tracked = tracked;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `operation` with `context` under the configured deadline.
    ///
    /// Before the operation starts, every tracked key is captured in memory and
    /// backed up. If the operation returns an error or misses the deadline, the
    /// captured values are written back and keys that did not exist are removed.
    /// A timed-out operation is dropped at its next suspension point; any writes
    /// it already made are undone by the same restore.
    pub async fn run<T, F, Fut>(&self, context: serde_json::Value, operation: F) -> TxReport<T>
    where
        F: FnOnce(serde_json::Value) -> Fut,
        Fut: Future<Output = Result<T, TxError>>,
    {
        let operation_id = Ulid::new();
        let started = Instant::now();
        tracing::debug!(%operation_id, %context, "transaction started");

        let snapshots = match self.capture() {
            Ok(snapshots) => snapshots,
            Err(e) => {
                // Nothing has been written yet, so there is nothing to undo.
                let duration = started.elapsed();
                self.diagnostics.log_error(
                    ErrorKind::TransactionFailed,
                    &e,
                    json!({ "operationId": operation_id.to_string(), "context": context }),
                );
                self.diagnostics.log_operation(
                    &operation_id.to_string(),
                    OperationStatus::RolledBack,
                    duration,
                );
                return TxReport {
                    operation_id,
                    duration,
                    outcome: Err(e),
                };
            }
        };

        let outcome = match tokio::time::timeout(self.timeout, operation(context.clone())).await {
            Ok(result) => result,
            Err(_) => Err(TxError::Timeout(self.timeout)),
        };

        let outcome = match outcome {
            Ok(value) => {
                self.diagnostics.log_operation(
                    &operation_id.to_string(),
                    OperationStatus::Committed,
                    started.elapsed(),
                );
                Ok(value)
            }
            Err(original) => Err(self.roll_back(operation_id, &snapshots, original, &context, started)),
        };

        TxReport {
            operation_id,
            duration: started.elapsed(),
            outcome,
        }
    }

    fn roll_back(
        &self,
        operation_id: Ulid,
        snapshots: &[Snapshot],
        original: TxError,
        context: &serde_json::Value,
        started: Instant,
    ) -> TxError {
        let id = operation_id.to_string();
        match self.restore(snapshots) {
            Ok(()) => {
                self.diagnostics.log_error(
                    ErrorKind::TransactionFailed,
                    &original,
                    json!({ "operationId": id, "context": context }),
                );
                self.diagnostics
                    .log_operation(&id, OperationStatus::RolledBack, started.elapsed());
                original
            }
            Err(rollback) => {
                let err = TxError::RollbackFailed {
                    original: Box::new(original),
                    rollback,
                };
                self.diagnostics.log_error(
                    ErrorKind::RollbackFailed,
                    &err,
                    json!({ "operationId": id, "context": context }),
                );
                self.diagnostics
                    .log_operation(&id, OperationStatus::RollbackFailed, started.elapsed());
                err
            }
        }
    }

    fn store_for(&self, scope: StoreScope) -> &dyn KvStore {
        match scope {
            StoreScope::Persistent => self.persistent.as_ref(),
            StoreScope::Session => self.session.as_ref(),
        }
    }

    fn capture(&self) -> Result<Vec<Snapshot>, TxError> {
        let mut snapshots = Vec::with_capacity(self.tracked.len());
        for tracked in &self.tracked {
            let value = self
                .store_for(tracked.scope)
                .get(&tracked.key)
                .map_err(|source| TxError::SnapshotFailed {
                    key: tracked.key.clone(),
                    source,
                })?;
            if let Some(v) = &value {
                self.backups.create_backup(&tracked.key, v);
            }
            snapshots.push(Snapshot {
                tracked: tracked.clone(),
                value,
            });
        }
        Ok(snapshots)
    }

    /// Put every captured key back. Keeps going after a failure so as many keys
    /// as possible are restored, then reports the first failure.
    fn restore(&self, snapshots: &[Snapshot]) -> Result<(), StoreError> {
        let mut first_error = None;
        for snapshot in snapshots {
            let store = self.store_for(snapshot.tracked.scope);
            let key = snapshot.tracked.key.as_str();
            let result = match &snapshot.value {
                Some(value) => store.set(key, value),
                None => store.remove(key),
            };
            if let Err(e) = result {
                tracing::error!(key, "failed to restore key: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
