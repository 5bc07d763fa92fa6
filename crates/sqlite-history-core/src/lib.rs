//! Trigger-based change history for `SQLite` tables.
//!
//! This crate is the pure half of the system: it validates a table's column
//! list into a [`TableSchema`] and turns it into SQL text. Nothing here touches
//! a database; see `sqlite-history-store-sqlite` for introspection and
//! execution.
//!
//! For a table `t` the generated objects are:
//! - `_t_history`: one row per recorded change,
//! - `idx_t_history_rowid`: index on `_t_history(_rowid)`,
//! - `t_insert_history`, `t_update_history`, `t_delete_history`: triggers.
//!
//! These names are part of the persisted contract and must not change.

#![allow(clippy::module_name_repetitions)]

use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

mod escape;
mod sql;

pub use escape::{escape, is_reserved_word};
pub use sql::{backfill_sql, configure_sql, history_table_sql, triggers_sql};

/// Widest table whose change mask still fits a signed 64-bit integer without
/// ever colliding with [`DELETE_MASK`].
pub const MAX_TRACKED_COLUMNS: usize = 63;

/// `_mask` value recorded for delete events.
pub const DELETE_MASK: i64 = -1;

/// Metadata columns every history table carries next to the tracked columns.
pub const HISTORY_METADATA_COLUMNS: [&str; 4] = ["_rowid", "_version", "_updated", "_mask"];

/// Names `SQLite` accepts for a row's native id, in the order they are tried.
/// A column declared with one of these names shadows it.
pub const ROWID_ALIASES: [&str; 3] = ["rowid", "_rowid_", "oid"];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HistoryError {
    #[error("table name must not be empty")]
    EmptyTableName,
    #[error("table {table} has no columns")]
    NoColumns { table: String },
    #[error("table {table} has a column with an empty name")]
    EmptyColumnName { table: String },
    #[error("table {table} declares column {column} more than once")]
    DuplicateColumn { table: String, column: String },
    #[error("column {column} of table {table} collides with a history metadata column")]
    MetadataColumn { table: String, column: String },
    #[error("identifier {0} contains ']' and cannot be bracket-quoted")]
    UnquotableIdentifier(String),
    #[error(
        "table {table} has {count} columns; at most {max} can be tracked",
        max = MAX_TRACKED_COLUMNS
    )]
    TooManyColumns { table: String, count: usize },
    #[error("table {table} declares columns named rowid, _rowid_ and oid; its row id is unreachable")]
    NoRowidAlias { table: String },
    #[error("failed to format timestamp: {0}")]
    Timestamp(String),
}

/// One column of a tracked table, as reported by schema introspection.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Column {
    pub name: String,
    /// Declared type exactly as written in the table definition; may be empty.
    pub declared_type: String,
}

impl Column {
    #[must_use]
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared_type: declared_type.into(),
        }
    }
}

/// A tracked table's name and its columns in declaration order.
///
/// Column order fixes the bit positions of `_mask`, so it must match the order
/// `pragma_table_info` reports.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TableSchema {
    table: String,
    columns: Vec<Column>,
    rowid_alias: &'static str,
}

impl TableSchema {
    /// Validates `columns` for history generation.
    ///
    /// # Errors
    /// Returns [`HistoryError`] when the table or column names cannot produce
    /// valid history SQL: empty names, no columns, duplicates (compared
    /// ASCII case-insensitively), collisions with the history metadata
    /// columns, names containing `]`, more than [`MAX_TRACKED_COLUMNS`]
    /// columns, or columns shadowing every entry of [`ROWID_ALIASES`].
    pub fn new(table: impl Into<String>, columns: Vec<Column>) -> Result<Self, HistoryError> {
        let table = table.into();
        if table.is_empty() {
            return Err(HistoryError::EmptyTableName);
        }
        ensure_quotable(&table)?;

        if columns.is_empty() {
            return Err(HistoryError::NoColumns { table });
        }
        if columns.len() > MAX_TRACKED_COLUMNS {
            return Err(HistoryError::TooManyColumns {
                count: columns.len(),
                table,
            });
        }

        let mut seen = HashSet::with_capacity(columns.len());
        for column in &columns {
            if column.name.is_empty() {
                return Err(HistoryError::EmptyColumnName { table });
            }
            ensure_quotable(&column.name)?;

            let folded = column.name.to_ascii_lowercase();
            if HISTORY_METADATA_COLUMNS.contains(&folded.as_str()) {
                return Err(HistoryError::MetadataColumn {
                    table,
                    column: column.name.clone(),
                });
            }
            if !seen.insert(folded) {
                return Err(HistoryError::DuplicateColumn {
                    table,
                    column: column.name.clone(),
                });
            }
        }

        let Some(alias) = rowid_alias(columns.iter().map(|column| column.name.as_str())) else {
            return Err(HistoryError::NoRowidAlias { table });
        };

        Ok(Self {
            table,
            columns,
            rowid_alias: alias,
        })
    }

    /// Builds a schema from column names only, with empty declared types.
    ///
    /// # Errors
    /// Same conditions as [`TableSchema::new`].
    pub fn from_names<I, S>(table: impl Into<String>, names: I) -> Result<Self, HistoryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns = names
            .into_iter()
            .map(|name| Column::new(name, String::new()))
            .collect();
        Self::new(table, columns)
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|column| column.name.as_str())
    }

    /// Name the triggers and backfill use to read the native row id.
    #[must_use]
    pub fn rowid_alias(&self) -> &'static str {
        self.rowid_alias
    }

    /// Mask with one bit set per tracked column: `2^n - 1`.
    #[must_use]
    pub fn full_mask(&self) -> i64 {
        full_mask(self.columns.len())
    }

    #[must_use]
    pub fn names(&self) -> HistoryNames {
        HistoryNames::for_table(&self.table)
    }
}

fn ensure_quotable(name: &str) -> Result<(), HistoryError> {
    if name.contains(']') {
        return Err(HistoryError::UnquotableIdentifier(name.to_string()));
    }
    Ok(())
}

/// First entry of [`ROWID_ALIASES`] not taken by a column (ASCII
/// case-insensitive), or `None` when all of them are.
#[must_use]
pub fn rowid_alias<'a, I>(column_names: I) -> Option<&'static str>
where
    I: IntoIterator<Item = &'a str> + Clone,
{
    ROWID_ALIASES.into_iter().find(|alias| {
        !column_names
            .clone()
            .into_iter()
            .any(|name| name.eq_ignore_ascii_case(alias))
    })
}

/// `2^column_count - 1`, saturating at [`MAX_TRACKED_COLUMNS`].
#[must_use]
pub fn full_mask(column_count: usize) -> i64 {
    if column_count == 0 {
        return 0;
    }
    let count = column_count.min(MAX_TRACKED_COLUMNS);
    i64::MAX >> (MAX_TRACKED_COLUMNS - count)
}

/// Mask bit for the column at `index` in declaration order.
#[must_use]
pub fn column_bit(index: usize) -> i64 {
    debug_assert!(index < MAX_TRACKED_COLUMNS);
    1_i64 << index
}

/// Unquoted names of every object installed for one tracked table.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryNames {
    pub history_table: String,
    pub rowid_index: String,
    pub insert_trigger: String,
    pub update_trigger: String,
    pub delete_trigger: String,
}

impl HistoryNames {
    #[must_use]
    pub fn for_table(table: &str) -> Self {
        Self {
            history_table: history_table_name(table),
            rowid_index: format!("idx_{table}_history_rowid"),
            insert_trigger: format!("{table}_insert_history"),
            update_trigger: format!("{table}_update_history"),
            delete_trigger: format!("{table}_delete_history"),
        }
    }
}

#[must_use]
pub fn history_table_name(table: &str) -> String {
    format!("_{table}_history")
}

/// True for names following the `_<table>_history` convention.
#[must_use]
pub fn is_history_table_name(name: &str) -> bool {
    name.len() > "__history".len() && name.starts_with('_') && name.ends_with("_history")
}

/// Unit recorded in `_updated`. One resolution is used for every trigger and
/// the backfill of a table.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimestampResolution {
    #[default]
    Seconds,
    Millis,
}

impl TimestampResolution {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Seconds => "seconds",
            Self::Millis => "millis",
        }
    }

    /// SQL expression evaluating to the current time in this resolution.
    #[must_use]
    pub fn now_sql(self) -> &'static str {
        match self {
            Self::Seconds => "strftime('%s', 'now')",
            Self::Millis => "CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)",
        }
    }
}

impl Display for TimestampResolution {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Knobs that change the generated SQL.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryOptions {
    pub timestamp: TimestampResolution,
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns an error when the timestamp cannot be represented in RFC3339.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, HistoryError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| HistoryError::Timestamp(err.to_string()))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
