// ABOUTME: Core library for kasir, containing the cash-closing domain model.
// ABOUTME: Defines closing records, record validation, store keys, and the discrepancy journal policy.

pub mod journal;
pub mod keys;
pub mod model;
pub mod validation;

pub use journal::{JournalEntry, JournalLine, discrepancy_journal, journal_id};
pub use model::{CashSession, ClosingRecord, DISCREPANCY_TOLERANCE, SalesSummary};
pub use validation::{ValidationIssue, ValidationReport, validate, validate_document};
