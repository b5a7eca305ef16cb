// ABOUTME: Configuration loading for the kasir ledger.
// ABOUTME: Reads KASIR_* environment variables with defaults for timeouts, retries, quota, and backup retention.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::writer::RetryPolicy;

/// Assumed capacity of the browser-style store when none is configured.
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid {expected}: {value:?}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub home: PathBuf,
    pub tx_timeout: Duration,
    pub retry: RetryPolicy,
    pub quota_bytes: usize,
    pub backup_retain: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            tx_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            quota_bytes: DEFAULT_QUOTA_BYTES,
            backup_retain: kasir_store::backup::DEFAULT_RETAIN,
        }
    }
}

fn default_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".kasir")
}

impl LedgerConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - KASIR_HOME: data directory (default: ~/.kasir)
    /// - KASIR_TX_TIMEOUT_SECS: transaction timeout (default: 30)
    /// - KASIR_RETRY_MAX_ATTEMPTS: write attempts before giving up (default: 3)
    /// - KASIR_RETRY_BASE_DELAY_MS: linear backoff step (default: 1000)
    /// - KASIR_STORE_QUOTA_BYTES: store capacity (default: 5 MiB)
    /// - KASIR_BACKUP_RETAIN: snapshots kept per key (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let home = get("KASIR_HOME").map(PathBuf::from).unwrap_or(defaults.home);

        let tx_timeout = parse::<u64>(&get, "KASIR_TX_TIMEOUT_SECS", "number of seconds")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.tx_timeout);

        let max_attempts = parse::<u32>(&get, "KASIR_RETRY_MAX_ATTEMPTS", "attempt count")?
            .unwrap_or(defaults.retry.max_attempts);
        if max_attempts == 0 {
            return Err(ConfigError::Zero("KASIR_RETRY_MAX_ATTEMPTS"));
        }

        let base_delay = parse::<u64>(&get, "KASIR_RETRY_BASE_DELAY_MS", "number of milliseconds")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.base_delay);

        let quota_bytes = parse::<usize>(&get, "KASIR_STORE_QUOTA_BYTES", "byte count")?
            .unwrap_or(defaults.quota_bytes);

        let backup_retain = parse::<usize>(&get, "KASIR_BACKUP_RETAIN", "snapshot count")?
            .unwrap_or(defaults.backup_retain);
        if backup_retain == 0 {
            return Err(ConfigError::Zero("KASIR_BACKUP_RETAIN"));
        }

        Ok(Self {
            home,
            tx_timeout,
            retry: RetryPolicy {
                max_attempts,
                base_delay,
            },
            quota_bytes,
            backup_retain,
        })
    }

    /// Path of the SQLite database inside the home directory.
    pub fn database_path(&self) -> PathBuf {
        self.home.join("kasir.db")
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                var,
                value,
                expected,
            }),
    }
}
