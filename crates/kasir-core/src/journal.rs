// ABOUTME: Double-entry journal types and the cash-discrepancy posting policy.
// ABOUTME: Maps a closing surplus or shortfall onto two balanced chart-of-accounts lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ClosingRecord;

/// Prefix of every discrepancy journal id; the closing record id follows it.
pub const JOURNAL_ID_PREFIX: &str = "JRN-SELISIH-";

pub const ACCOUNT_CASH: &str = "Kas";
pub const ACCOUNT_OTHER_INCOME: &str = "Pendapatan Lain-lain";
pub const ACCOUNT_OTHER_EXPENSE: &str = "Beban Lain-lain";

/// Used in the description when a closing carries no remark.
pub const REMARK_PLACEHOLDER: &str = "tanpa keterangan";

/// Source tag for journal entries generated by cash closing.
pub const SOURCE_CASH_CLOSING: &str = "tutup_kasir";

/// One line of a journal entry. Exactly one of debit/credit is non-zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalLine {
    pub account: String,
    pub debit: f64,
    pub credit: f64,
}

impl JournalLine {
    pub fn debit(account: &str, amount: f64) -> Self {
        Self {
            account: account.to_owned(),
            debit: amount,
            credit: 0.0,
        }
    }

    pub fn credit(account: &str, amount: f64) -> Self {
        Self {
            account: account.to_owned(),
            debit: 0.0,
            credit: amount,
        }
    }
}

/// A balanced double-entry journal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub id: String,
    pub date: String,
    pub description: String,
    pub lines: Vec<JournalLine>,
    pub reference: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn total_debit(&self) -> f64 {
        self.lines.iter().map(|l| l.debit).sum()
    }

    pub fn total_credit(&self) -> f64 {
        self.lines.iter().map(|l| l.credit).sum()
    }

    pub fn is_balanced(&self) -> bool {
        (self.total_debit() - self.total_credit()).abs() < 1e-6
    }
}

/// Deterministic journal id for a closing record. Posting the same closing
/// twice yields the same id, which callers treat as "already posted".
pub fn journal_id(closing_id: &str) -> String {
    format!("{JOURNAL_ID_PREFIX}{closing_id}")
}

/// Build the discrepancy journal entry for a closing record. Returns None when
/// the discrepancy is within tolerance.
///
/// A surplus debits cash and credits other income; a shortfall debits other
/// expense and credits cash.
pub fn discrepancy_journal(record: &ClosingRecord) -> Option<JournalEntry> {
    if !record.has_discrepancy() {
        return None;
    }

    let amount = record.discrepancy.abs();
    let lines = if record.discrepancy > 0.0 {
        vec![
            JournalLine::debit(ACCOUNT_CASH, amount),
            JournalLine::credit(ACCOUNT_OTHER_INCOME, amount),
        ]
    } else {
        vec![
            JournalLine::debit(ACCOUNT_OTHER_EXPENSE, amount),
            JournalLine::credit(ACCOUNT_CASH, amount),
        ]
    };

    let kind = if record.discrepancy > 0.0 { "Kelebihan" } else { "Kekurangan" };
    let remark = record
        .discrepancy_remark
        .as_deref()
        .filter(|r| !r.trim().is_empty())
        .unwrap_or(REMARK_PLACEHOLDER);

    Some(JournalEntry {
        id: journal_id(&record.id),
        date: record.closing_date.clone(),
        description: format!(
            "{kind} kas tutup kasir {} - {}: {remark}",
            record.closing_date, record.cashier_name
        ),
        lines,
        reference: record.id.clone(),
        source: SOURCE_CASH_CLOSING.to_owned(),
        created_at: Utc::now(),
    })
}
