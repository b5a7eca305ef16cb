// ABOUTME: SQLite-backed KvStore holding one JSON document per key.
// ABOUTME: Durable home for closing history, balance, journal, and backup snapshots, with an optional byte quota.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};

use crate::store::{KvStore, StoreError, check_quota};

/// A durable key-value store on a single SQLite table. The connection is
/// guarded by a mutex so the store can be shared across components.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    quota_bytes: Option<usize>,
}

impl SqliteStore {
    /// Open or create a store database at the given path.
    pub fn open(path: &Path, quota_bytes: Option<usize>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("cannot create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn, quota_bytes)
    }

    /// Open a throwaway in-memory database.
    pub fn open_in_memory(quota_bytes: Option<usize>) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, quota_bytes)
    }

    fn init(conn: Connection, quota_bytes: Option<usize>) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            quota_bytes,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))
    }

    fn usage_locked(conn: &Connection) -> Result<usize, StoreError> {
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0) FROM kv",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(total).unwrap_or(0))
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        if self.quota_bytes.is_some() {
            let usage = Self::usage_locked(&conn)?;
            let replaced = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get::<_, String>(0)
                })
                .optional()?
                .map(|v| key.len() + v.len())
                .unwrap_or(0);
            check_quota(self.quota_bytes, usage, replaced, key, value)?;
        }
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    fn usage_bytes(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        Self::usage_locked(&conn)
    }
}
