// ABOUTME: Best-effort snapshots of a key's prior value, with rotation and recovery.
// ABOUTME: Snapshots live in the same store under `backup_<key>_<millis>`; the newest few per key are kept.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kasir_core::keys::BACKUP_PREFIX;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::diagnostics::{Diagnostics, ErrorKind};
use crate::store::{KvStore, StoreError};

/// Snapshots retained per key unless configured otherwise.
pub const DEFAULT_RETAIN: usize = 5;

/// Errors that can occur during backup operations.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no backup found for key {0}")]
    NotFound(String),
}

/// The stored form of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    pub original_key: String,
    pub timestamp: DateTime<Utc>,
    pub data: String,
}

/// Location of one snapshot in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRef {
    pub store_key: String,
    pub millis: i64,
}

/// Result of restoring a key from its newest snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryReceipt {
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

fn snapshot_prefix(key: &str) -> String {
    format!("{BACKUP_PREFIX}{key}_")
}

/// Millisecond timestamp embedded in a snapshot key of any original key.
fn snapshot_millis(store_key: &str) -> Option<i64> {
    let (_, suffix) = store_key.strip_prefix(BACKUP_PREFIX)?.rsplit_once('_')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Creates, rotates, and restores per-key snapshots.
#[derive(Clone)]
pub struct BackupManager {
    store: Arc<dyn KvStore>,
    diagnostics: Arc<Diagnostics>,
    retain: usize,
}

impl BackupManager {
    pub fn new(store: Arc<dyn KvStore>, diagnostics: Arc<Diagnostics>) -> Self {
        Self::with_retain(store, diagnostics, DEFAULT_RETAIN)
    }

    pub fn with_retain(store: Arc<dyn KvStore>, diagnostics: Arc<Diagnostics>, retain: usize) -> Self {
        Self {
            store,
            diagnostics,
            retain: retain.max(1),
        }
    }

    /// Snapshot `value` as the prior content of `key`, then rotate. Failures
    /// are logged and swallowed; returns the snapshot key when one was written.
    pub fn create_backup(&self, key: &str, value: &str) -> Option<String> {
        match self.try_create_backup(key, value) {
            Ok(store_key) => Some(store_key),
            Err(e) => {
                self.diagnostics
                    .log_error(ErrorKind::BackupFailed, &e, json!({ "key": key }));
                None
            }
        }
    }

    /// Snapshot and rotate, reporting failures to the caller.
    pub fn try_create_backup(&self, key: &str, value: &str) -> Result<String, BackupError> {
        // Timestamps per key are strictly increasing so rotation order is total
        // even when several backups land in the same millisecond.
        let now = Utc::now();
        let millis = match self.list_backups(key)?.first() {
            Some(latest) if latest.millis >= now.timestamp_millis() => latest.millis + 1,
            _ => now.timestamp_millis(),
        };
        let timestamp = DateTime::from_timestamp_millis(millis).unwrap_or(now);

        let snapshot = BackupSnapshot {
            original_key: key.to_owned(),
            timestamp,
            data: value.to_owned(),
        };
        let store_key = format!("{}{millis}", snapshot_prefix(key));
        self.store.set(&store_key, &serde_json::to_string(&snapshot)?)?;
        self.diagnostics.record_backup(timestamp);
        tracing::debug!(key, snapshot = %store_key, "backup created");

        if let Err(e) = self.clean_old_backups(key) {
            self.diagnostics
                .log_error(ErrorKind::BackupFailed, &e, json!({ "key": key, "phase": "rotate" }));
        }

        Ok(store_key)
    }

    /// All snapshots of `key`, newest first.
    pub fn list_backups(&self, key: &str) -> Result<Vec<BackupRef>, BackupError> {
        let prefix = snapshot_prefix(key);
        let mut refs: Vec<BackupRef> = self
            .store
            .keys()?
            .into_iter()
            .filter_map(|store_key| {
                // Digits only, so `backup_a_` does not pick up `backup_a_b_<millis>`.
                let millis = store_key
                    .strip_prefix(&prefix)
                    .filter(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))?
                    .parse::<i64>()
                    .ok()?;
                Some(BackupRef { store_key, millis })
            })
            .collect();
        refs.sort_by(|a, b| b.millis.cmp(&a.millis));
        Ok(refs)
    }

    /// Delete all but the newest `retain` snapshots of `key`. Returns how many were removed.
    pub fn clean_old_backups(&self, key: &str) -> Result<usize, BackupError> {
        let stale: Vec<BackupRef> = self.list_backups(key)?.into_iter().skip(self.retain).collect();
        for backup in &stale {
            self.store.remove(&backup.store_key)?;
        }
        if !stale.is_empty() {
            tracing::debug!(key, removed = stale.len(), "rotated old backups");
        }
        Ok(stale.len())
    }

    /// Newest snapshot of `key`, if any.
    pub fn latest_backup(&self, key: &str) -> Result<Option<BackupSnapshot>, BackupError> {
        let Some(latest) = self.list_backups(key)?.into_iter().next() else {
            return Ok(None);
        };
        match self.store.get(&latest.store_key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Overwrite `key` with its newest snapshot.
    pub fn recover_from_backup(&self, key: &str) -> Result<RecoveryReceipt, BackupError> {
        let snapshot = self
            .latest_backup(key)?
            .ok_or_else(|| BackupError::NotFound(key.to_owned()))?;
        self.store.set(key, &snapshot.data)?;
        tracing::info!(key, timestamp = %snapshot.timestamp, "restored key from backup");
        Ok(RecoveryReceipt {
            key: key.to_owned(),
            timestamp: snapshot.timestamp,
        })
    }

    /// Time of the newest snapshot of any key, read from the snapshot names.
    pub fn newest_backup_time(&self) -> Result<Option<DateTime<Utc>>, BackupError> {
        let newest = self
            .store
            .keys()?
            .iter()
            .filter_map(|store_key| snapshot_millis(store_key))
            .max();
        Ok(newest.and_then(DateTime::from_timestamp_millis))
    }

    /// Delete snapshots of any key older than `max_age`. Returns how many were removed.
    pub fn clean_expired(&self, max_age: chrono::Duration) -> Result<usize, BackupError> {
        let cutoff = (Utc::now() - max_age).timestamp_millis();
        let mut removed = 0;
        for store_key in self.store.keys()? {
            if let Some(millis) = snapshot_millis(&store_key)
                && millis < cutoff
            {
                self.store.remove(&store_key)?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "removed expired backups");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn manager() -> (Arc<MemoryStore>, Arc<Diagnostics>, BackupManager) {
        let store = Arc::new(MemoryStore::new());
        let diagnostics = Arc::new(Diagnostics::new());
        let mgr = BackupManager::new(store.clone(), diagnostics.clone());
        (store, diagnostics, mgr)
    }

    #[test]
    fn backup_then_corrupt_then_recover_restores_value() {
        let (store, diagnostics, mgr) = manager();
        let original = r#"[{"id":"TK-1"}]"#;
        store.set("riwayat", original).unwrap();

        mgr.create_backup("riwayat", original).expect("backup written");
        store.set("riwayat", "{corrupt").unwrap();

        let receipt = mgr.recover_from_backup("riwayat").unwrap();
        assert_eq!(store.get("riwayat").unwrap().as_deref(), Some(original));
        assert_eq!(receipt.key, "riwayat");
        assert_eq!(diagnostics.last_backup(), Some(receipt.timestamp));
    }

    #[test]
    fn rotation_keeps_five_newest() {
        let (store, _diag, mgr) = manager();
        for i in 0..8 {
            mgr.create_backup("saldo", &i.to_string()).unwrap();
        }

        let backups = mgr.list_backups("saldo").unwrap();
        assert_eq!(backups.len(), DEFAULT_RETAIN);
        assert!(backups.windows(2).all(|w| w[0].millis > w[1].millis));

        let latest = mgr.latest_backup("saldo").unwrap().unwrap();
        assert_eq!(latest.data, "7");
        assert_eq!(latest.original_key, "saldo");

        let oldest_kept = mgr.list_backups("saldo").unwrap().last().cloned().unwrap();
        let raw = store.get(&oldest_kept.store_key).unwrap().unwrap();
        let snapshot: BackupSnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(snapshot.data, "3");
    }

    #[test]
    fn backups_of_similar_keys_do_not_mix() {
        let (_store, _diag, mgr) = manager();
        mgr.create_backup("a", "1").unwrap();
        mgr.create_backup("a_b", "2").unwrap();

        assert_eq!(mgr.list_backups("a").unwrap().len(), 1);
        assert_eq!(mgr.latest_backup("a").unwrap().unwrap().data, "1");
    }

    #[test]
    fn newest_backup_time_spans_all_keys() {
        let (store, _diagnostics, backups) = manager();
        assert!(backups.newest_backup_time().unwrap().is_none());

        store.set("backup_saldo_kas_1700000000000", "{}").unwrap();
        store.set("backup_riwayat_tutup_kasir_1700000005000", "{}").unwrap();
        store.set("backup_saldo_kas_latest", "{}").unwrap();
        store.set("saldo_kas", "1.0").unwrap();

        let newest = backups.newest_backup_time().unwrap().unwrap();
        assert_eq!(newest.timestamp_millis(), 1_700_000_005_000);
    }

    #[test]
    fn recover_without_backup_is_not_found() {
        let (_store, _diag, mgr) = manager();
        let err = mgr.recover_from_backup("missing").unwrap_err();
        assert!(matches!(err, BackupError::NotFound(k) if k == "missing"));
    }

    #[test]
    fn failed_backup_is_logged_and_swallowed() {
        let store = Arc::new(MemoryStore::with_quota(8));
        let diagnostics = Arc::new(Diagnostics::new());
        let mgr = BackupManager::new(store, diagnostics.clone());

        assert!(mgr.create_backup("riwayat", "a long value that cannot fit").is_none());

        let errors = diagnostics.recent_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::BackupFailed);
        assert!(diagnostics.last_backup().is_none());
    }

    #[test]
    fn clean_expired_removes_only_old_snapshots() {
        let (store, _diag, mgr) = manager();
        let old = (Utc::now() - chrono::Duration::hours(25)).timestamp_millis();
        let old_key = format!("backup_saldo_{old}");
        let old_snapshot = BackupSnapshot {
            original_key: "saldo".into(),
            timestamp: DateTime::from_timestamp_millis(old).unwrap(),
            data: "1".into(),
        };
        store.set(&old_key, &serde_json::to_string(&old_snapshot).unwrap()).unwrap();
        let fresh_key = mgr.create_backup("saldo", "2").unwrap();
        store.set("saldo", "2").unwrap();

        let removed = mgr.clean_expired(chrono::Duration::hours(24)).unwrap();

        assert_eq!(removed, 1);
        assert!(store.get(&old_key).unwrap().is_none());
        assert!(store.get(&fresh_key).unwrap().is_some());
        assert!(store.get("saldo").unwrap().is_some());
    }
}
