// ABOUTME: Entry point for the kasir binary.
// ABOUTME: Parses CLI arguments, initializes tracing, and runs closing, health, history, and backup commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use kasir_core::validation::{parse_timestamp, validate_document};
use kasir_core::{CashSession, ClosingRecord, keys};
use kasir_ledger::{Accounting, Ledger, LedgerConfig};
use kasir_store::{KvStore, MemoryStore, SqliteStore};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "kasir", version, about = "Cash-closing ledger for the koperasi back office")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Commit a closing record read from a JSON file
    Close {
        #[arg(long)]
        record: PathBuf,
    },
    /// Print error volume, last backup, and store usage
    Health,
    /// Print the committed closing history
    History,
    /// Restore a key from its newest backup
    Recover {
        #[arg(long)]
        key: String,
    },
    /// List the backups of a key, newest first
    Backups {
        #[arg(long)]
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kasir=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = LedgerConfig::from_env()?;
    let store = SqliteStore::open(&config.database_path(), Some(config.quota_bytes))
        .with_context(|| format!("opening {}", config.database_path().display()))?;
    tracing::debug!(home = %config.home.display(), "kasir starting up");

    let session = Arc::new(MemoryStore::new());

    match cli.command {
        Command::Close { record } => {
            let record = read_record(&record)?;
            seed_session(session.as_ref(), &record)?;
            let ledger = Ledger::new(config, Arc::new(store), session, Accounting::Builtin);

            let receipt = ledger.closing().save_closing_record(&record).await?;
            print_json(&json!({
                "id": receipt.id,
                "operationId": receipt.operation_id.to_string(),
                "journal": format!("{:?}", receipt.journal),
                "runningBalance": ledger.closing().running_balance(),
            }))?;
        }
        Command::Health => {
            let ledger = Ledger::new(config, Arc::new(store), session, Accounting::Builtin);
            print_json(&ledger.health())?;
        }
        Command::History => {
            let ledger = Ledger::new(config, Arc::new(store), session, Accounting::Builtin);
            print_json(&ledger.closing().history())?;
        }
        Command::Recover { key } => {
            let ledger = Ledger::new(config, Arc::new(store), session, Accounting::Builtin);
            let receipt = ledger.recover(&key)?;
            print_json(&json!({
                "key": receipt.key,
                "timestamp": receipt.timestamp.to_rfc3339(),
            }))?;
        }
        Command::Backups { key } => {
            let ledger = Ledger::new(config, Arc::new(store), session, Accounting::Builtin);
            let backups: Vec<_> = ledger
                .backups(&key)?
                .into_iter()
                .map(|b| json!({ "storeKey": b.store_key, "millis": b.millis }))
                .collect();
            print_json(&backups)?;
        }
    }

    Ok(())
}

/// Parse and check a closing record file, reporting every problem at once.
fn read_record(path: &PathBuf) -> anyhow::Result<ClosingRecord> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let doc: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    let report = validate_document(&doc);
    if !report.is_valid() {
        bail!("{} is not a valid closing record: {}", path.display(), report.summary());
    }
    Ok(serde_json::from_value(doc)?)
}

/// The point of sale keeps the open session in its own session store; a CLI
/// close stands in for it with the session the record was taken from.
fn seed_session(session: &dyn KvStore, record: &ClosingRecord) -> anyhow::Result<()> {
    let Some(opened_at) = parse_timestamp(&record.opened_at) else {
        bail!("openedAt {:?} is not a timestamp", record.opened_at);
    };
    let open = CashSession {
        shift_id: record.shift_id.clone(),
        cashier_id: record.cashier_id.clone(),
        cashier_name: record.cashier_name.clone(),
        opening_float: record.opening_float,
        opened_at,
    };
    session.set(keys::CASH_SESSION, &serde_json::to_string(&open)?)?;
    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
