// ABOUTME: Optional accounting integration that can take over balance updates and journal posting.
// ABOUTME: Chosen at construction: delegate to an integration, or use the built-in fallback.

use std::sync::Arc;

use async_trait::async_trait;
use kasir_core::ClosingRecord;
use thiserror::Error;

/// Failure reported by an accounting integration.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("accounting integration failed: {}", .messages.join("; "))]
pub struct AccountingError {
    pub messages: Vec<String>,
}

impl AccountingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
        }
    }
}

/// An external accounting module that owns the running balance and journal.
#[async_trait]
pub trait AccountingIntegration: Send + Sync {
    /// Apply the record's discrepancy to the running balance. A failure aborts
    /// the closing.
    async fn process_balance_update(&self, record: &ClosingRecord) -> Result<(), AccountingError>;

    /// Post the discrepancy journal entry. A failure is logged but does not
    /// abort the closing.
    async fn post_discrepancy_journal(&self, record: &ClosingRecord) -> Result<(), AccountingError>;

    /// Integration name for logging.
    fn name(&self) -> &str;
}

/// How balance updates and discrepancy journals are handled.
#[derive(Clone, Default)]
pub enum Accounting {
    /// Adjust the balance key and append to the journal list directly.
    #[default]
    Builtin,
    /// Hand both steps to an external integration.
    Delegate(Arc<dyn AccountingIntegration>),
}

impl std::fmt::Debug for Accounting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Accounting::Builtin => f.write_str("Builtin"),
            Accounting::Delegate(integration) => {
                f.debug_tuple("Delegate").field(&integration.name()).finish()
            }
        }
    }
}
