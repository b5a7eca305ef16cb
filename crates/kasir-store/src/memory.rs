// ABOUTME: In-memory KvStore backed by a mutex-guarded BTreeMap.
// ABOUTME: Supports an optional byte quota so quota refusals can be reproduced without a real browser store.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::store::{KvStore, StoreError, check_quota};

/// A process-local key-value store. Used for the per-shift session store and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that refuses writes once keys plus values exceed `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, String>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.lock()?;
        if self.quota_bytes.is_some() {
            let usage: usize = entries.iter().map(|(k, v)| k.len() + v.len()).sum();
            let replaced = entries.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
            check_quota(self.quota_bytes, usage, replaced, key, value)?;
        }
        entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn usage_bytes(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.iter().map(|(k, v)| k.len() + v.len()).sum())
    }
}
