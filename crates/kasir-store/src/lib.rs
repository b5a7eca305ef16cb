// ABOUTME: Persistence layer for kasir: key-value store backends, backups, and diagnostics.
// ABOUTME: Provides the KvStore contract, in-memory and SQLite stores, backup rotation/recovery, and health reporting.

pub mod backup;
pub mod diagnostics;
pub mod memory;
pub mod sqlite;
pub mod store;
pub mod testing;

pub use backup::{BackupError, BackupManager, BackupRef, BackupSnapshot, RecoveryReceipt};
pub use diagnostics::{
    Diagnostics, ErrorEntry, ErrorKind, Health, HealthStatus, OperationEntry, OperationStatus,
    StorageUsage,
};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{KvStore, StoreError};
