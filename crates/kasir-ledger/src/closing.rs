// ABOUTME: End-of-shift cash closing: commits a closing record inside one transaction.
// ABOUTME: Appends history, clears the session, and on a discrepancy adjusts the balance and posts a journal.

use std::sync::Arc;

use kasir_core::journal::{JournalEntry, discrepancy_journal};
use kasir_core::keys;
use kasir_core::validation::{ValidationReport, validate};
use kasir_core::{CashSession, ClosingRecord};
use kasir_store::{Diagnostics, ErrorKind, KvStore};
use serde_json::{Value, json};
use thiserror::Error;
use ulid::Ulid;

use crate::accounting::Accounting;
use crate::transaction::{TransactionExecutor, TxError};
use crate::writer::RetryingWriter;

/// Errors returned to the caller of a closing.
#[derive(Debug, Error)]
pub enum ClosingError {
    #[error("closing record rejected: {0}")]
    Invalid(ValidationReport),

    #[error("closing {operation_id} rolled back: {source}")]
    Transaction { operation_id: Ulid, source: TxError },
}

/// What happened to the discrepancy journal of a committed closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalStatus {
    /// The discrepancy was within tolerance.
    NotRequired,
    Posted,
    /// An entry with the same id was already in the journal.
    AlreadyPosted,
    /// Posting failed; the closing still stands.
    Failed(String),
}

/// A committed closing.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosingReceipt {
    pub id: String,
    pub operation_id: Ulid,
    pub journal: JournalStatus,
}

/// Orchestrates the shift-closing transaction.
pub struct ClosingService {
    executor: TransactionExecutor,
    writer: RetryingWriter,
    session: Arc<dyn KvStore>,
    diagnostics: Arc<Diagnostics>,
    accounting: Accounting,
}

impl ClosingService {
    pub fn new(
        executor: TransactionExecutor,
        writer: RetryingWriter,
        session: Arc<dyn KvStore>,
        diagnostics: Arc<Diagnostics>,
        accounting: Accounting,
    ) -> Self {
        Self {
            executor,
            writer,
            session,
            diagnostics,
            accounting,
        }
    }

    /// Validate and commit a closing record. Either the history append, session
    /// clear, and balance adjustment all take effect, or none of them do.
    pub async fn save_closing_record(&self, record: &ClosingRecord) -> Result<ClosingReceipt, ClosingError> {
        let report = validate(record);
        if !report.is_valid() {
            self.diagnostics.log_error(
                ErrorKind::ValidationFailed,
                &report,
                json!({ "closingId": record.id }),
            );
            return Err(ClosingError::Invalid(report));
        }

        let context = json!({
            "operation": "tutup_kasir",
            "closingId": record.id,
            "shiftId": record.shift_id,
            "cashierId": record.cashier_id,
        });
        let tx = self
            .executor
            .run(context, |_ctx| self.commit(record))
            .await;

        match tx.outcome {
            Ok(journal) => {
                tracing::info!(
                    closing_id = %record.id,
                    operation_id = %tx.operation_id,
                    discrepancy = record.discrepancy,
                    ?journal,
                    "shift closed"
                );
                Ok(ClosingReceipt {
                    id: record.id.clone(),
                    operation_id: tx.operation_id,
                    journal,
                })
            }
            Err(source) => Err(ClosingError::Transaction {
                operation_id: tx.operation_id,
                source,
            }),
        }
    }

    async fn commit(&self, record: &ClosingRecord) -> Result<JournalStatus, TxError> {
        let report = validate(record);
        if !report.is_valid() {
            return Err(TxError::Validation(report));
        }

        let mut history = self.load_history_for_append()?;
        history.push(record.clone());
        self.writer.save_json(keys::CLOSING_HISTORY, &history).await?;

        self.session.remove(keys::CASH_SESSION)?;

        if !record.has_discrepancy() {
            return Ok(JournalStatus::NotRequired);
        }

        match &self.accounting {
            Accounting::Builtin => {
                let balance = self
                    .writer
                    .try_load_json::<f64>(keys::CASH_BALANCE)?
                    .unwrap_or(0.0)
                    + record.discrepancy;
                self.writer.save_json(keys::CASH_BALANCE, &balance).await?;
                Ok(self.post_journal(record).await)
            }
            Accounting::Delegate(integration) => {
                integration.process_balance_update(record).await?;
                match integration.post_discrepancy_journal(record).await {
                    Ok(()) => Ok(JournalStatus::Posted),
                    Err(e) => Ok(self.journal_failed(record, &e)),
                }
            }
        }
    }

    /// History to append to. A missing or corrupt list starts over empty (the
    /// prior text is kept in the backup taken before the write); an unreadable
    /// store aborts.
    fn load_history_for_append(&self) -> Result<Vec<ClosingRecord>, TxError> {
        match self.writer.try_load_json::<Vec<ClosingRecord>>(keys::CLOSING_HISTORY) {
            Ok(history) => Ok(history.unwrap_or_default()),
            Err(e) if e.is_corrupt() => {
                tracing::warn!("starting a new closing history: {}", e);
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Append the discrepancy journal entry. Never fails the closing.
    async fn post_journal(&self, record: &ClosingRecord) -> JournalStatus {
        let Some(entry) = discrepancy_journal(record) else {
            return JournalStatus::NotRequired;
        };

        // Kept as raw documents: the journal also holds entries from other modules.
        // Anything but a readable list is left untouched.
        let mut journal: Vec<Value> = match self.writer.try_load_json(keys::JOURNAL) {
            Ok(journal) => journal.unwrap_or_default(),
            Err(e) => return self.journal_failed(record, &e),
        };
        if journal
            .iter()
            .any(|e| e.get("id").and_then(Value::as_str) == Some(entry.id.as_str()))
        {
            tracing::info!(journal_id = %entry.id, "discrepancy journal already posted");
            return JournalStatus::AlreadyPosted;
        }

        let doc = match serde_json::to_value(&entry) {
            Ok(doc) => doc,
            Err(e) => return self.journal_failed(record, &e),
        };
        journal.push(doc);

        match self.writer.save_json(keys::JOURNAL, &journal).await {
            Ok(_) => JournalStatus::Posted,
            Err(e) => self.journal_failed(record, &e),
        }
    }

    fn journal_failed(&self, record: &ClosingRecord, error: &dyn std::fmt::Display) -> JournalStatus {
        self.diagnostics.log_error(
            ErrorKind::JournalPostingFailed,
            error,
            json!({ "closingId": record.id, "discrepancy": record.discrepancy }),
        );
        JournalStatus::Failed(error.to_string())
    }

    /// Committed closing records, oldest first. A missing or corrupt list reads as empty.
    pub fn history(&self) -> Vec<ClosingRecord> {
        self.writer.load_json(keys::CLOSING_HISTORY).unwrap_or_default()
    }

    /// Current running cash balance; zero when never set.
    pub fn running_balance(&self) -> f64 {
        self.writer.load_json(keys::CASH_BALANCE).unwrap_or(0.0)
    }

    /// The whole general journal as stored, including entries from other modules.
    pub fn journal(&self) -> Vec<Value> {
        self.writer.load_json(keys::JOURNAL).unwrap_or_default()
    }

    /// Discrepancy journal entries produced by cash closing.
    pub fn discrepancy_journal_entries(&self) -> Vec<JournalEntry> {
        self.journal()
            .into_iter()
            .filter_map(|doc| serde_json::from_value::<JournalEntry>(doc).ok())
            .collect()
    }

    /// The session of the shift currently open, if any.
    pub fn current_session(&self) -> Option<CashSession> {
        match self.session.get(keys::CASH_SESSION) {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("could not read cash session: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::{AccountingError, AccountingIntegration};
    use crate::writer::RetryPolicy;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use kasir_core::SalesSummary;
    use kasir_core::journal::journal_id;
    use kasir_store::testing::{Fault, FaultyStore};
    use kasir_store::{BackupManager, MemoryStore};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Fixture {
        store: Arc<FaultyStore>,
        session: Arc<MemoryStore>,
        diagnostics: Arc<Diagnostics>,
        service: ClosingService,
    }

    fn fixture(accounting: Accounting) -> Fixture {
        let store = Arc::new(FaultyStore::new());
        let session = Arc::new(MemoryStore::new());
        let diagnostics = Arc::new(Diagnostics::new());
        let backups = BackupManager::new(store.clone(), diagnostics.clone());
        let writer = RetryingWriter::new(
            store.clone(),
            backups.clone(),
            diagnostics.clone(),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
            },
        );
        let executor = TransactionExecutor::new(
            store.clone(),
            session.clone(),
            backups,
            diagnostics.clone(),
            Duration::from_secs(30),
        );
        let service = ClosingService::new(
            executor,
            writer,
            session.clone(),
            diagnostics.clone(),
            accounting,
        );
        Fixture {
            store,
            session,
            diagnostics,
            service,
        }
    }

    /// Open a shift with a 100 000 float and 50 000 cash sales, then close it.
    fn close_shift(f: &Fixture, actual_cash: f64, remark: Option<&str>) -> ClosingRecord {
        let session = CashSession::open("K-01", "Siti", 100_000.0);
        f.session
            .set(keys::CASH_SESSION, &serde_json::to_string(&session).unwrap())
            .unwrap();
        let sales = SalesSummary {
            cash_sales: 50_000.0,
            credit_sales: 15_000.0,
            transaction_count: 9,
        };
        ClosingRecord::from_session(
            &session,
            &sales,
            actual_cash,
            remark.map(str::to_owned),
            session.opened_at + ChronoDuration::hours(8),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn balanced_close_commits_without_journal() {
        let f = fixture(Accounting::Builtin);
        f.store.set(keys::CASH_BALANCE, "1000.0").unwrap();
        let record = close_shift(&f, 150_000.0, None);

        let receipt = f.service.save_closing_record(&record).await.unwrap();

        assert_eq!(receipt.id, record.id);
        assert_eq!(receipt.journal, JournalStatus::NotRequired);
        assert_eq!(f.service.history(), vec![record.clone()]);
        assert_eq!(f.service.running_balance(), 1000.0);
        assert!(f.service.current_session().is_none());
        assert!(f.store.get(keys::JOURNAL).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn surplus_adjusts_balance_and_posts_journal() {
        let f = fixture(Accounting::Builtin);
        let record = close_shift(&f, 160_000.0, Some("kembalian lebih"));

        let receipt = f.service.save_closing_record(&record).await.unwrap();

        assert_eq!(receipt.journal, JournalStatus::Posted);
        assert_eq!(f.service.running_balance(), 10_000.0);
        let entries = f.service.discrepancy_journal_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, journal_id(&record.id));
        assert_eq!(entries[0].lines[0].account, "Kas");
        assert_eq!(entries[0].lines[1].account, "Pendapatan Lain-lain");
        assert!(entries[0].is_balanced());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_record_is_rejected_before_any_write() {
        let f = fixture(Accounting::Builtin);
        let record = close_shift(&f, 155_000.0, None);

        let err = f.service.save_closing_record(&record).await.unwrap_err();

        assert!(matches!(err, ClosingError::Invalid(ref r) if !r.is_valid()));
        assert!(f.service.history().is_empty());
        assert!(f.service.current_session().is_some());
        assert!(f.diagnostics.recent_operations().is_empty());
        assert_eq!(f.diagnostics.recent_errors()[0].kind, ErrorKind::ValidationFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn balance_write_failure_rolls_back_history_and_session() {
        let f = fixture(Accounting::Builtin);
        let earlier = close_shift(&f, 150_000.0, None);
        f.service.save_closing_record(&earlier).await.unwrap();
        f.store.set(keys::CASH_BALANCE, "2500.0").unwrap();

        let record = close_shift(&f, 140_000.0, Some("kurang setor"));
        f.store.fail_sets(keys::CASH_BALANCE, Fault::Unavailable, 3);

        let err = f.service.save_closing_record(&record).await.unwrap_err();

        assert!(matches!(
            err,
            ClosingError::Transaction {
                source: TxError::Write(_),
                ..
            }
        ));
        assert_eq!(f.service.history(), vec![earlier]);
        assert_eq!(f.service.running_balance(), 2500.0);
        assert!(f.service.current_session().is_some());
        assert!(f.service.discrepancy_journal_entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn journal_failure_does_not_abort_the_close() {
        let f = fixture(Accounting::Builtin);
        let record = close_shift(&f, 140_000.0, Some("kurang setor"));
        f.store.fail_sets(keys::JOURNAL, Fault::Quota, usize::MAX);

        let receipt = f.service.save_closing_record(&record).await.unwrap();

        assert!(matches!(receipt.journal, JournalStatus::Failed(_)));
        assert_eq!(f.service.running_balance(), -10_000.0);
        assert_eq!(f.service.history().len(), 1);
        assert!(
            f.diagnostics
                .recent_errors()
                .iter()
                .any(|e| e.kind == ErrorKind::JournalPostingFailed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn existing_journal_id_counts_as_already_posted() {
        let f = fixture(Accounting::Builtin);
        let record = close_shift(&f, 160_000.0, Some("kembalian lebih"));
        let existing = json!([
            { "id": "JU-0001", "description": "setoran modal" },
            { "id": journal_id(&record.id), "description": "posted earlier" }
        ]);
        f.store.set(keys::JOURNAL, &existing.to_string()).unwrap();

        let receipt = f.service.save_closing_record(&record).await.unwrap();

        assert_eq!(receipt.journal, JournalStatus::AlreadyPosted);
        let raw: Vec<Value> = serde_json::from_str(&f.store.get(keys::JOURNAL).unwrap().unwrap()).unwrap();
        assert_eq!(raw.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_journal_entries_are_preserved() {
        let f = fixture(Accounting::Builtin);
        f.store
            .set(keys::JOURNAL, r#"[{"id":"JU-0001","description":"setoran modal"}]"#)
            .unwrap();
        let record = close_shift(&f, 140_000.0, Some("kurang setor"));

        f.service.save_closing_record(&record).await.unwrap();

        let raw = f.service.journal();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0]["id"], "JU-0001");
        assert_eq!(f.service.discrepancy_journal_entries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_history_is_treated_as_empty() {
        let f = fixture(Accounting::Builtin);
        f.store.set(keys::CLOSING_HISTORY, "{not json").unwrap();
        let record = close_shift(&f, 150_000.0, None);

        f.service.save_closing_record(&record).await.unwrap();

        assert_eq!(f.service.history(), vec![record]);
        let backups = BackupManager::new(f.store.clone(), f.diagnostics.clone());
        assert!(
            backups
                .list_backups(keys::CLOSING_HISTORY)
                .unwrap()
                .iter()
                .any(|b| f.store.get(&b.store_key).unwrap().unwrap().contains("{not json"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_history_aborts_instead_of_starting_over() {
        let f = fixture(Accounting::Builtin);
        let earlier = close_shift(&f, 150_000.0, None);
        f.service.save_closing_record(&earlier).await.unwrap();
        f.store.set(keys::CASH_BALANCE, "250000.0").unwrap();
        let record = close_shift(&f, 160_000.0, Some("kembalian lebih"));
        // The executor's snapshot read succeeds; the append read fails.
        f.store.fail_gets(keys::CLOSING_HISTORY, 1, 1);

        let err = f.service.save_closing_record(&record).await.unwrap_err();

        assert!(matches!(
            err,
            ClosingError::Transaction {
                source: TxError::Load(_),
                ..
            }
        ));
        assert_eq!(f.service.history(), vec![earlier.clone()]);
        assert_eq!(f.service.running_balance(), 250_000.0);
        assert!(f.service.current_session().is_some());

        f.service.save_closing_record(&record).await.unwrap();
        assert_eq!(f.service.history(), vec![earlier, record]);
        assert_eq!(f.service.running_balance(), 260_000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_balance_aborts_instead_of_resetting() {
        let f = fixture(Accounting::Builtin);
        f.store.set(keys::CASH_BALANCE, "250000.0").unwrap();
        let record = close_shift(&f, 160_000.0, Some("kembalian lebih"));
        f.store.fail_gets(keys::CASH_BALANCE, 1, 1);

        let err = f.service.save_closing_record(&record).await.unwrap_err();

        assert!(matches!(
            err,
            ClosingError::Transaction {
                source: TxError::Load(_),
                ..
            }
        ));
        assert_eq!(f.service.running_balance(), 250_000.0);
        assert!(f.service.history().is_empty());
        assert!(f.service.current_session().is_some());
        assert!(f.store.get(keys::JOURNAL).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn non_numeric_balance_aborts() {
        let f = fixture(Accounting::Builtin);
        f.store.set(keys::CASH_BALANCE, r#""dua ratus ribu""#).unwrap();
        let record = close_shift(&f, 140_000.0, Some("kurang setor"));

        let err = f.service.save_closing_record(&record).await.unwrap_err();

        match err {
            ClosingError::Transaction {
                source: TxError::Load(e),
                ..
            } => assert!(e.is_corrupt()),
            other => panic!("expected corrupt balance, got {other:?}"),
        }
        assert_eq!(
            f.store.get(keys::CASH_BALANCE).unwrap().as_deref(),
            Some(r#""dua ratus ribu""#)
        );
        assert!(f.service.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_journal_is_left_untouched() {
        let f = fixture(Accounting::Builtin);
        let existing = r#"[{"id":"JU-0001","description":"setoran modal"}]"#;
        f.store.set(keys::JOURNAL, existing).unwrap();
        let record = close_shift(&f, 140_000.0, Some("kurang setor"));
        f.store.fail_gets(keys::JOURNAL, 0, 1);

        let receipt = f.service.save_closing_record(&record).await.unwrap();

        assert!(matches!(receipt.journal, JournalStatus::Failed(_)));
        assert_eq!(f.store.get(keys::JOURNAL).unwrap().as_deref(), Some(existing));
        assert_eq!(f.service.running_balance(), -10_000.0);
        assert_eq!(f.service.history(), vec![record]);
    }

    #[tokio::test(start_paused = true)]
    async fn non_list_journal_is_left_untouched() {
        let f = fixture(Accounting::Builtin);
        let existing = r#"{"entries":[{"id":"JU-0001"}]}"#;
        f.store.set(keys::JOURNAL, existing).unwrap();
        let record = close_shift(&f, 160_000.0, Some("kembalian lebih"));

        let receipt = f.service.save_closing_record(&record).await.unwrap();

        assert!(matches!(receipt.journal, JournalStatus::Failed(_)));
        assert_eq!(f.store.get(keys::JOURNAL).unwrap().as_deref(), Some(existing));
        assert!(
            f.diagnostics
                .recent_errors()
                .iter()
                .any(|e| e.kind == ErrorKind::JournalPostingFailed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn session_is_cleared_whatever_it_held() {
        let f = fixture(Accounting::Builtin);

        let record = close_shift(&f, 150_000.0, None);
        f.session.remove(keys::CASH_SESSION).unwrap();
        f.service.save_closing_record(&record).await.unwrap();
        assert!(f.session.get(keys::CASH_SESSION).unwrap().is_none());

        let record = close_shift(&f, 150_000.0, None);
        f.session.set(keys::CASH_SESSION, "bukan sesi").unwrap();
        assert!(f.service.current_session().is_none());
        f.service.save_closing_record(&record).await.unwrap();
        assert!(f.session.get(keys::CASH_SESSION).unwrap().is_none());

        assert_eq!(f.service.history().len(), 2);
    }

    #[derive(Default)]
    struct RecordingIntegration {
        balance_calls: Mutex<Vec<String>>,
        journal_calls: Mutex<Vec<String>>,
        reject_balance: bool,
        reject_journal: bool,
    }

    #[async_trait]
    impl AccountingIntegration for RecordingIntegration {
        async fn process_balance_update(&self, record: &ClosingRecord) -> Result<(), AccountingError> {
            self.balance_calls.lock().unwrap().push(record.id.clone());
            if self.reject_balance {
                return Err(AccountingError::new("akun kas terkunci"));
            }
            Ok(())
        }

        async fn post_discrepancy_journal(&self, record: &ClosingRecord) -> Result<(), AccountingError> {
            self.journal_calls.lock().unwrap().push(record.id.clone());
            if self.reject_journal {
                return Err(AccountingError::new("periode ditutup"));
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delegate_handles_balance_and_journal() {
        let integration = Arc::new(RecordingIntegration::default());
        let f = fixture(Accounting::Delegate(integration.clone()));
        let record = close_shift(&f, 160_000.0, Some("kembalian lebih"));

        let receipt = f.service.save_closing_record(&record).await.unwrap();

        assert_eq!(receipt.journal, JournalStatus::Posted);
        assert_eq!(*integration.balance_calls.lock().unwrap(), vec![record.id.clone()]);
        assert_eq!(*integration.journal_calls.lock().unwrap(), vec![record.id.clone()]);
        // The built-in keys are left alone.
        assert!(f.store.get(keys::CASH_BALANCE).unwrap().is_none());
        assert!(f.store.get(keys::JOURNAL).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delegate_is_not_called_without_discrepancy() {
        let integration = Arc::new(RecordingIntegration::default());
        let f = fixture(Accounting::Delegate(integration.clone()));
        let record = close_shift(&f, 150_000.0, None);

        f.service.save_closing_record(&record).await.unwrap();

        assert!(integration.balance_calls.lock().unwrap().is_empty());
        assert!(integration.journal_calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delegate_balance_rejection_rolls_back() {
        let integration = Arc::new(RecordingIntegration {
            reject_balance: true,
            ..Default::default()
        });
        let f = fixture(Accounting::Delegate(integration.clone()));
        let record = close_shift(&f, 140_000.0, Some("kurang setor"));

        let err = f.service.save_closing_record(&record).await.unwrap_err();

        assert!(matches!(
            err,
            ClosingError::Transaction {
                source: TxError::Accounting(_),
                ..
            }
        ));
        assert!(f.service.history().is_empty());
        assert!(f.service.current_session().is_some());
        assert!(integration.journal_calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delegate_journal_rejection_is_swallowed() {
        let integration = Arc::new(RecordingIntegration {
            reject_journal: true,
            ..Default::default()
        });
        let f = fixture(Accounting::Delegate(integration));
        let record = close_shift(&f, 140_000.0, Some("kurang setor"));

        let receipt = f.service.save_closing_record(&record).await.unwrap();

        assert!(matches!(receipt.journal, JournalStatus::Failed(ref m) if m.contains("periode ditutup")));
        assert_eq!(f.service.history().len(), 1);
    }
}
