// ABOUTME: Well-known store keys shared by every kasir component.
// ABOUTME: The first three form the tracked set protected by the transaction executor.

/// Persistent list of committed closing records.
pub const CLOSING_HISTORY: &str = "riwayat_tutup_kasir";

/// Ephemeral cash session for the shift currently open (lives in the session store).
pub const CASH_SESSION: &str = "sesi_kasir";

/// Running cash balance, stored as a bare JSON number.
pub const CASH_BALANCE: &str = "saldo_kas";

/// Persistent list of accounting journal entries.
pub const JOURNAL: &str = "jurnal_umum";

/// Throwaway key written and removed to probe store availability.
pub const PROBE: &str = "__kasir_probe__";

/// Prefix of every backup snapshot key: `backup_<key>_<millis>`.
pub const BACKUP_PREFIX: &str = "backup_";
