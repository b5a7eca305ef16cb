// ABOUTME: Defines the cash session, sales summary, and closing record types.
// ABOUTME: Closing records are derived from an open session plus the counted cash at shift end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Differences at or below this magnitude are treated as no discrepancy.
pub const DISCREPANCY_TOLERANCE: f64 = 0.01;

/// The cash session opened at the start of a shift. Created by the point-of-sale
/// "open shift" action and removed when the shift is successfully closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashSession {
    pub shift_id: String,
    pub cashier_id: String,
    pub cashier_name: String,
    pub opening_float: f64,
    pub opened_at: DateTime<Utc>,
}

impl CashSession {
    /// Open a session for a cashier with the given float. Generates a fresh shift id.
    pub fn open(cashier_id: &str, cashier_name: &str, opening_float: f64) -> Self {
        Self {
            shift_id: format!("SHIFT-{}", Ulid::new()),
            cashier_id: cashier_id.to_owned(),
            cashier_name: cashier_name.to_owned(),
            opening_float,
            opened_at: Utc::now(),
        }
    }
}

/// Sales recorded by the point of sale during one shift.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesSummary {
    pub cash_sales: f64,
    pub credit_sales: f64,
    pub transaction_count: u32,
}

impl SalesSummary {
    pub fn gross_sales(&self) -> f64 {
        self.cash_sales + self.credit_sales
    }
}

/// One committed end-of-shift reconciliation. Appended to the closing history
/// and never mutated afterwards.
///
/// Timestamps are kept as the RFC 3339 text they are stored as, so records
/// read back from the store can be checked for unparsable dates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosingRecord {
    pub id: String,
    pub shift_id: String,
    pub cashier_id: String,
    pub cashier_name: String,
    pub opened_at: String,
    pub closed_at: String,
    pub opening_float: f64,
    pub gross_sales: f64,
    pub cash_sales: f64,
    pub credit_sales: f64,
    pub transaction_count: u32,
    pub expected_cash: f64,
    pub actual_cash: f64,
    pub discrepancy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discrepancy_remark: Option<String>,
    pub closing_date: String,
}

impl ClosingRecord {
    /// Build a closing record from the open session and the physically counted
    /// cash. Expected cash is the opening float plus cash sales; the discrepancy
    /// is counted cash minus expected cash.
    pub fn from_session(
        session: &CashSession,
        sales: &SalesSummary,
        actual_cash: f64,
        remark: Option<String>,
        closed_at: DateTime<Utc>,
    ) -> Self {
        let expected_cash = session.opening_float + sales.cash_sales;
        Self {
            id: format!("TK-{}", Ulid::new()),
            shift_id: session.shift_id.clone(),
            cashier_id: session.cashier_id.clone(),
            cashier_name: session.cashier_name.clone(),
            opened_at: session.opened_at.to_rfc3339(),
            closed_at: closed_at.to_rfc3339(),
            opening_float: session.opening_float,
            gross_sales: sales.gross_sales(),
            cash_sales: sales.cash_sales,
            credit_sales: sales.credit_sales,
            transaction_count: sales.transaction_count,
            expected_cash,
            actual_cash,
            discrepancy: actual_cash - expected_cash,
            discrepancy_remark: remark.filter(|r| !r.trim().is_empty()),
            closing_date: closed_at.date_naive().to_string(),
        }
    }

    /// True when the discrepancy is large enough to move the running balance
    /// and require a journal entry.
    pub fn has_discrepancy(&self) -> bool {
        self.discrepancy.abs() > DISCREPANCY_TOLERANCE
    }
}
