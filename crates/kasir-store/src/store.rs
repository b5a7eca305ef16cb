// ABOUTME: The synchronous key-value store contract every kasir component writes through.
// ABOUTME: Values are whole JSON documents; a write may be refused when the store is full.

use thiserror::Error;

/// Errors a key-value store can report.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage quota exceeded writing {key}: {needed} bytes needed, {available} available")]
    QuotaExceeded {
        key: String,
        needed: usize,
        available: usize,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// True when the store refused a write for lack of space.
    pub fn is_quota(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded { .. })
    }
}

/// A synchronous string key-value store with enumeration. Implementations use
/// interior mutability so one instance can be shared behind an `Arc`.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store a value, replacing any previous one. Fails with
    /// [`StoreError::QuotaExceeded`] when the store has no room left.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a key. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// All keys currently held, in no guaranteed order.
    fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Total size of all keys and values, in bytes.
    fn usage_bytes(&self) -> Result<usize, StoreError> {
        let mut total = 0;
        for key in self.keys()? {
            let value_len = self.get(&key)?.map(|v| v.len()).unwrap_or(0);
            total += key.len() + value_len;
        }
        Ok(total)
    }
}

/// Check whether replacing an entry keeps the store within its quota.
/// `current_usage` includes the entry being replaced, if any.
pub(crate) fn check_quota(
    quota: Option<usize>,
    current_usage: usize,
    replaced_len: usize,
    key: &str,
    value: &str,
) -> Result<(), StoreError> {
    let Some(quota) = quota else {
        return Ok(());
    };
    let needed = key.len() + value.len();
    let available = quota.saturating_sub(current_usage.saturating_sub(replaced_len));
    if needed > available {
        return Err(StoreError::QuotaExceeded {
            key: key.to_owned(),
            needed,
            available,
        });
    }
    Ok(())
}
