#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use sqlite_history_core::{
    backfill_sql, configure_sql, escape, history_table_name, history_table_sql,
    is_history_table_name, rowid_alias, triggers_sql, Column, HistoryOptions, TableSchema,
};
use tracing::{debug, info};

pub struct SqliteHistoryStore {
    conn: Connection,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// `_<table>_history` already exists.
    AlreadyConfigured,
    /// The table is itself a history table.
    HistoryTable,
}

impl SkipReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyConfigured => "already_configured",
            Self::HistoryTable => "history_table",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableOutcome {
    Configured {
        table: String,
        history_table: String,
        backfilled_rows: usize,
    },
    Skipped {
        table: String,
        history_table: String,
        reason: SkipReason,
    },
    Planned {
        table: String,
        history_table: String,
        sql: String,
    },
}

impl TableOutcome {
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::Configured { table, .. }
            | Self::Skipped { table, .. }
            | Self::Planned { table, .. } => table,
        }
    }
}

impl SqliteHistoryStore {
    /// Opens an existing database file. Missing files are an error rather than
    /// being created empty.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("database file does not exist: {}", path.display()));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        table_exists(&self.conn, table)
    }

    pub fn history_table_exists(&self, table: &str) -> Result<bool> {
        history_table_exists(&self.conn, table)
    }

    /// Columns of `table` in declaration order, validated for history
    /// generation.
    pub fn table_schema(&self, table: &str) -> Result<TableSchema> {
        trackable_schema(&self.conn, table)
    }

    /// Every table `--all` should track.
    ///
    /// Skips virtual tables (FTS, rtree, ...) together with their shadow
    /// tables (any table whose name starts with a virtual table's name),
    /// `WITHOUT ROWID` tables, `sqlite_*` internal tables and existing
    /// `_<name>_history` tables.
    pub fn regular_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name
                 FROM sqlite_master
                 WHERE type = 'table'
                   AND (
                     sql LIKE 'CREATE VIRTUAL TABLE%'
                     OR name IN ('sqlite_stat1', 'sqlite_stat2', 'sqlite_stat3', 'sqlite_stat4')
                   )",
            )
            .context("failed to prepare hidden table query")?;
        let hidden = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list hidden tables")?;

        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY rowid ASC")
            .context("failed to prepare table listing")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list tables")?;

        let mut tables = Vec::with_capacity(names.len());
        for name in names
            .into_iter()
            .filter(|name| !hidden.iter().any(|prefix| name.starts_with(prefix.as_str())))
            .filter(|name| !name.starts_with("sqlite_"))
            .filter(|name| !is_history_table_name(name))
        {
            if is_without_rowid(&self.conn, &name)? {
                debug!(table = %name, "skipping WITHOUT ROWID table");
                continue;
            }
            tables.push(name);
        }
        Ok(tables)
    }

    /// Turns the command-line table selection into a validated list.
    ///
    /// Nothing is written: every configuration error is raised before any
    /// table is touched.
    pub fn resolve_tables(&self, requested: &[String], all: bool) -> Result<Vec<String>> {
        if all {
            return self.regular_tables();
        }
        if requested.is_empty() {
            return Err(anyhow!(
                "no tables provided; pass one or more table names or use --all"
            ));
        }

        let mut missing = Vec::new();
        for table in requested {
            if !self.table_exists(table)? {
                missing.push(table.as_str());
            }
        }
        if !missing.is_empty() {
            return Err(anyhow!(
                "the following tables do not exist: {}",
                missing.join(", ")
            ));
        }

        Ok(requested.to_vec())
    }

    /// Reports what [`Self::configure_history`] would do without writing.
    pub fn plan_history(&self, table: &str, options: HistoryOptions) -> Result<TableOutcome> {
        if let Some(skipped) = skip_outcome(&self.conn, table)? {
            return Ok(skipped);
        }

        let schema = trackable_schema(&self.conn, table)?;
        Ok(TableOutcome::Planned {
            table: table.to_string(),
            history_table: history_table_name(table),
            sql: configure_sql(&schema, options),
        })
    }

    /// Installs the history table, triggers and backfill for `table`.
    ///
    /// Runs in one `BEGIN IMMEDIATE` transaction, so the backfill cannot race
    /// another writer and a failure leaves the schema untouched.
    pub fn configure_history(
        &mut self,
        table: &str,
        options: HistoryOptions,
    ) -> Result<TableOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("failed to start history transaction for {table}"))?;

        if let Some(skipped) = skip_outcome(&tx, table)? {
            return Ok(skipped);
        }

        let schema = trackable_schema(&tx, table)?;
        let history_table = history_table_name(table);

        let create_sql = history_table_sql(&schema);
        debug!(table, sql = %create_sql, "creating history table");
        tx.execute_batch(&create_sql)
            .with_context(|| format!("failed to create {history_table}"))?;

        let trigger_sql = triggers_sql(&schema, options);
        debug!(table, sql = %trigger_sql, "creating history triggers");
        tx.execute_batch(&trigger_sql)
            .with_context(|| format!("failed to create history triggers for {table}"))?;

        let backfill = backfill_sql(&schema, options);
        debug!(table, sql = %backfill, "backfilling history");
        let backfilled_rows = tx
            .execute(backfill.trim_end(), [])
            .with_context(|| format!("failed to backfill {history_table}"))?;

        tx.commit()
            .with_context(|| format!("failed to commit history transaction for {table}"))?;

        info!(
            table,
            history_table = %history_table,
            backfilled_rows,
            timestamp = %options.timestamp,
            "configured history"
        );

        Ok(TableOutcome::Configured {
            table: table.to_string(),
            history_table,
            backfilled_rows,
        })
    }

    /// Configures each table in order, or plans them when `dry_run` is set.
    ///
    /// Every table that would be configured is checked before the first one
    /// is written, so an untrackable table fails the call with nothing
    /// changed. Each table then commits on its own.
    pub fn configure_tables(
        &mut self,
        tables: &[String],
        options: HistoryOptions,
        dry_run: bool,
    ) -> Result<Vec<TableOutcome>> {
        for table in tables {
            if skip_reason(&self.conn, table)?.is_none() {
                trackable_schema(&self.conn, table)?;
            }
        }

        let mut outcomes = Vec::with_capacity(tables.len());
        for table in tables {
            let outcome = if dry_run {
                self.plan_history(table, options)?
            } else {
                self.configure_history(table, options)?
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

fn skip_reason(conn: &Connection, table: &str) -> Result<Option<SkipReason>> {
    if is_history_table_name(table) {
        return Ok(Some(SkipReason::HistoryTable));
    }
    if history_table_exists(conn, table)? {
        return Ok(Some(SkipReason::AlreadyConfigured));
    }
    Ok(None)
}

fn skip_outcome(conn: &Connection, table: &str) -> Result<Option<TableOutcome>> {
    Ok(skip_reason(conn, table)?.map(|reason| {
        info!(table, reason = reason.as_str(), "skipping history setup");
        TableOutcome::Skipped {
            table: table.to_string(),
            history_table: history_table_name(table),
            reason,
        }
    }))
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn history_table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1 COLLATE NOCASE
             LIMIT 1",
            params![history_table_name(table)],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn table_sql(conn: &Connection, table: &str) -> Result<Option<Option<String>>> {
    conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get::<_, Option<String>>(0),
    )
    .optional()
    .with_context(|| format!("failed to inspect table {table}"))
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<Column>> {
    let mut stmt = conn
        .prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid ASC")
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let columns = stmt
        .query_map(params![table], |row| {
            Ok(Column::new(
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to read columns of {table}"))?;
    Ok(columns)
}

/// Whether `table` exposes a native row id under `alias`.
///
/// Only "no such column" means the table has none; any other failure is
/// propagated.
fn has_rowid(conn: &Connection, table: &str, alias: &str) -> Result<bool> {
    let sql = format!("SELECT {alias} FROM {} LIMIT 0", escape(table));
    match conn.prepare(&sql) {
        Ok(_) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(_, Some(message)))
            if message.starts_with("no such column") =>
        {
            Ok(false)
        }
        Err(err) => Err(err).with_context(|| format!("failed to check the row id of {table}")),
    }
}

fn is_without_rowid(conn: &Connection, table: &str) -> Result<bool> {
    let columns = table_columns(conn, table)?;
    match rowid_alias(columns.iter().map(|column| column.name.as_str())) {
        Some(alias) => Ok(!has_rowid(conn, table, alias)?),
        // Every alias is shadowed; `trackable_schema` reports this case.
        None => Ok(false),
    }
}

/// Introspects `table` and checks it can carry rowid-based history triggers.
fn trackable_schema(conn: &Connection, table: &str) -> Result<TableSchema> {
    let Some(sql) = table_sql(conn, table)? else {
        return Err(anyhow!("table {table} does not exist"));
    };

    if table.starts_with("sqlite_") {
        return Err(anyhow!("cannot track history for internal table {table}"));
    }
    let is_virtual = sql.as_deref().is_some_and(|sql| {
        sql.trim_start()
            .to_ascii_uppercase()
            .starts_with("CREATE VIRTUAL TABLE")
    });
    if is_virtual {
        return Err(anyhow!("cannot track history for virtual table {table}"));
    }

    let schema = TableSchema::new(table, table_columns(conn, table)?)
        .map_err(|err| anyhow!("cannot track history for {table}: {err}"))?;

    if !has_rowid(conn, schema.table(), schema.rowid_alias())? {
        return Err(anyhow!(
            "cannot track history for {table}: WITHOUT ROWID tables are not supported"
        ));
    }

    Ok(schema)
}
