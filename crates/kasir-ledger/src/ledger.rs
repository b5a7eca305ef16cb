// ABOUTME: Wires stores, diagnostics, backups, the writer, and the executor into one closing ledger.
// ABOUTME: Exposes the closing service plus health, backup listing, and recovery for operators.

use std::sync::Arc;

use kasir_store::{BackupError, BackupManager, BackupRef, Diagnostics, HealthStatus, KvStore, RecoveryReceipt};

use crate::accounting::Accounting;
use crate::closing::ClosingService;
use crate::config::LedgerConfig;
use crate::transaction::TransactionExecutor;
use crate::writer::{CleanupReport, RetryingWriter};

/// Everything needed to close shifts against one persistent store and one session store.
pub struct Ledger {
    config: LedgerConfig,
    persistent: Arc<dyn KvStore>,
    diagnostics: Arc<Diagnostics>,
    backups: BackupManager,
    writer: RetryingWriter,
    closing: ClosingService,
}

impl Ledger {
    pub fn new(
        config: LedgerConfig,
        persistent: Arc<dyn KvStore>,
        session: Arc<dyn KvStore>,
        accounting: Accounting,
    ) -> Self {
        let diagnostics = Arc::new(Diagnostics::new());
        let backups = BackupManager::with_retain(
            persistent.clone(),
            diagnostics.clone(),
            config.backup_retain,
        );
        match backups.newest_backup_time() {
            Ok(Some(at)) => diagnostics.record_backup(at),
            Ok(None) => {}
            Err(e) => tracing::warn!("could not scan existing backups: {}", e),
        }
        let writer = RetryingWriter::new(
            persistent.clone(),
            backups.clone(),
            diagnostics.clone(),
            config.retry,
        );
        let executor = TransactionExecutor::new(
            persistent.clone(),
            session.clone(),
            backups.clone(),
            diagnostics.clone(),
            config.tx_timeout,
        );
        let closing = ClosingService::new(
            executor,
            writer.clone(),
            session,
            diagnostics.clone(),
            accounting,
        );

        tracing::debug!(
            timeout = ?config.tx_timeout,
            max_attempts = config.retry.max_attempts,
            quota_bytes = config.quota_bytes,
            "ledger ready"
        );

        Self {
            config,
            persistent,
            diagnostics,
            backups,
            writer,
            closing,
        }
    }

    pub fn closing(&self) -> &ClosingService {
        &self.closing
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn health(&self) -> HealthStatus {
        self.diagnostics
            .health_status(self.persistent.as_ref(), self.config.quota_bytes)
    }

    /// Snapshots of `key`, newest first.
    pub fn backups(&self, key: &str) -> Result<Vec<BackupRef>, BackupError> {
        self.backups.list_backups(key)
    }

    /// Restore `key` in the persistent store from its newest snapshot.
    pub fn recover(&self, key: &str) -> Result<RecoveryReceipt, BackupError> {
        self.backups.recover_from_backup(key)
    }

    pub fn cleanup(&self) -> CleanupReport {
        self.writer.run_cleanup()
    }
}
