// ABOUTME: Transaction layer for kasir: verified writes, multi-key rollback, and the shift-closing flow.
// ABOUTME: Builds on kasir-store backends and kasir-core records; configured from KASIR_* environment variables.

pub mod accounting;
pub mod closing;
pub mod config;
pub mod ledger;
pub mod transaction;
pub mod writer;

pub use accounting::{Accounting, AccountingError, AccountingIntegration};
pub use closing::{ClosingError, ClosingReceipt, ClosingService, JournalStatus};
pub use config::{ConfigError, LedgerConfig};
pub use ledger::Ledger;
pub use transaction::{StoreScope, TrackedKey, TransactionExecutor, TxError, TxReport, closing_tracked_keys};
pub use writer::{CleanupReport, LoadError, RetryPolicy, RetryingWriter, WriteError, WriteFailure, WriteReceipt};
