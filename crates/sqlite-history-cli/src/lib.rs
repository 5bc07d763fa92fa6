//! Command surface for installing trigger-based history on `SQLite` tables.
//!
//! Host programs can embed it through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`configure`] to obtain a [`ConfigureReport`] without printing.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sqlite_history_core::{format_rfc3339, now_utc, HistoryOptions, TimestampResolution};
use sqlite_history_store_sqlite::{SkipReason, SqliteHistoryStore, TableOutcome};
use tracing::{debug, warn};

const REPORT_CONTRACT_VERSION: &str = "configure.v1";

#[derive(Debug, Parser)]
#[command(name = "sqlite-history")]
#[command(about = "Track changes to SQLite tables using triggers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create history tables and triggers for one or more tables.
    Configure(ConfigureArgs),
}

#[derive(Debug, Args)]
pub struct ConfigureArgs {
    /// Path to an existing SQLite database file.
    database: PathBuf,
    /// Tables to configure.
    tables: Vec<String>,
    /// Configure every regular table in the database.
    #[arg(long)]
    all: bool,
    /// Print the SQL that would run without changing the database.
    #[arg(long)]
    dry_run: bool,
    /// Print a JSON report instead of text.
    #[arg(long)]
    json: bool,
    /// Unit recorded in the `_updated` column.
    #[arg(long, value_enum, default_value_t = TimestampArg::Seconds)]
    timestamp: TimestampArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TimestampArg {
    Seconds,
    Millis,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ConfigureReport {
    pub contract_version: String,
    pub generated_at: String,
    pub database: String,
    pub dry_run: bool,
    pub timestamp: TimestampResolution,
    pub tables: Vec<TableOutcome>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the database is missing, the table selection is
/// invalid, or installing history fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Configure(args) => {
            let report = configure(&args)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(())
        }
    }
}

/// Validates the selection, then configures (or plans) each table in order.
///
/// # Errors
/// Configuration errors (missing database, no tables, unknown tables) are
/// returned before any table is modified.
pub fn configure(args: &ConfigureArgs) -> Result<ConfigureReport> {
    let mut store = SqliteHistoryStore::open(&args.database)?;
    let tables = store.resolve_tables(&args.tables, args.all)?;
    if tables.is_empty() {
        warn!(database = %args.database.display(), "no regular tables to configure");
    }
    debug!(?tables, dry_run = args.dry_run, "resolved table selection");
    let options = HistoryOptions {
        timestamp: map_timestamp(args.timestamp),
    };

    let outcomes = store.configure_tables(&tables, options, args.dry_run)?;
    for outcome in &outcomes {
        debug!(table = outcome.table(), ?outcome, "table processed");
    }

    Ok(ConfigureReport {
        contract_version: REPORT_CONTRACT_VERSION.to_string(),
        generated_at: format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?,
        database: args.database.display().to_string(),
        dry_run: args.dry_run,
        timestamp: options.timestamp,
        tables: outcomes,
    })
}

fn map_timestamp(value: TimestampArg) -> TimestampResolution {
    match value {
        TimestampArg::Seconds => TimestampResolution::Seconds,
        TimestampArg::Millis => TimestampResolution::Millis,
    }
}

fn print_report(report: &ConfigureReport) {
    if report.tables.is_empty() {
        println!("No tables to configure.");
        return;
    }

    for outcome in &report.tables {
        match outcome {
            TableOutcome::Configured {
                table,
                history_table,
                backfilled_rows,
            } => println!(
                "Configured history for {table} in {history_table} ({backfilled_rows} existing rows backfilled)."
            ),
            TableOutcome::Skipped {
                history_table,
                reason: SkipReason::AlreadyConfigured,
                ..
            } => println!("History table {history_table} already exists - skipping."),
            TableOutcome::Skipped {
                table,
                reason: SkipReason::HistoryTable,
                ..
            } => println!("{table} is a history table - skipping."),
            TableOutcome::Planned { sql, .. } => {
                println!("-- {}", outcome.table());
                print!("{sql}");
            }
        }
    }
}
