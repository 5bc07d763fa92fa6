use crate::{column_bit, escape, Column, HistoryOptions, TableSchema, DELETE_MASK};

/// Escaped names shared by every statement generated for one table.
struct Quoted {
    table: String,
    rowid: &'static str,
    history_table: String,
    rowid_index: String,
    insert_trigger: String,
    update_trigger: String,
    delete_trigger: String,
    columns: Vec<String>,
}

impl Quoted {
    fn new(schema: &TableSchema) -> Self {
        let names = schema.names();
        Self {
            table: escape(schema.table()),
            rowid: schema.rowid_alias(),
            history_table: escape(&names.history_table),
            rowid_index: escape(&names.rowid_index),
            insert_trigger: escape(&names.insert_trigger),
            update_trigger: escape(&names.update_trigger),
            delete_trigger: escape(&names.delete_trigger),
            columns: schema.column_names().map(escape).collect(),
        }
    }

    /// `_rowid, <columns>, _version, _updated, _mask`
    fn insert_columns(&self) -> String {
        format!("_rowid, {}, _version, _updated, _mask", self.columns.join(", "))
    }

    fn prefixed(&self, prefix: &str) -> String {
        self.columns
            .iter()
            .map(|column| format!("{prefix}.{column}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn next_version(&self) -> String {
        format!(
            "(SELECT COALESCE(MAX(_version), 0) FROM {} WHERE _rowid = old.{}) + 1",
            self.history_table, self.rowid
        )
    }
}

fn column_definition(quoted_name: &str, column: &Column) -> String {
    let declared_type = column.declared_type.trim();
    if declared_type.is_empty() {
        format!("    {quoted_name}")
    } else {
        format!("    {quoted_name} {declared_type}")
    }
}

/// Null-safe "value changed" predicate for one column.
fn changed(column: &str) -> String {
    format!("old.{column} IS NOT new.{column}")
}

/// `CREATE TABLE` for `_<table>_history` followed by the `_rowid` index.
///
/// Tracked columns keep their declared types but drop every constraint, so
/// update rows can leave unchanged columns null.
#[must_use]
pub fn history_table_sql(schema: &TableSchema) -> String {
    let quoted = Quoted::new(schema);
    let column_definitions = quoted
        .columns
        .iter()
        .zip(schema.columns())
        .map(|(name, column)| column_definition(name, column))
        .collect::<Vec<_>>()
        .join(",\n");

    format!(
        "CREATE TABLE {history_table} (
    _rowid INTEGER,
{column_definitions},
    _version INTEGER,
    _updated INTEGER,
    _mask INTEGER
);
CREATE INDEX {rowid_index} ON {history_table} (_rowid);
",
        history_table = quoted.history_table,
        rowid_index = quoted.rowid_index,
    )
}

/// Insert, update and delete triggers, in that order.
///
/// The update trigger only writes a row when at least one column changed
/// under `IS NOT`, so `NULL -> NULL` counts as unchanged.
#[must_use]
pub fn triggers_sql(schema: &TableSchema, options: HistoryOptions) -> String {
    let quoted = Quoted::new(schema);
    let now = options.timestamp.now_sql();
    let insert_columns = quoted.insert_columns();

    let insert_trigger = format!(
        "CREATE TRIGGER {trigger}
AFTER INSERT ON {table}
BEGIN
    INSERT INTO {history_table} ({insert_columns})
    VALUES (new.{rowid}, {new_values}, 1, {now}, {mask});
END;
",
        trigger = quoted.insert_trigger,
        rowid = quoted.rowid,
        table = quoted.table,
        history_table = quoted.history_table,
        new_values = quoted.prefixed("new"),
        mask = schema.full_mask(),
    );

    let changed_values = quoted
        .columns
        .iter()
        .map(|column| {
            format!(
                "        CASE WHEN {} THEN new.{column} ELSE NULL END",
                changed(column)
            )
        })
        .collect::<Vec<_>>()
        .join(",\n");
    let mask_terms = quoted
        .columns
        .iter()
        .enumerate()
        .map(|(index, column)| {
            format!(
                "(CASE WHEN {} THEN {} ELSE 0 END)",
                changed(column),
                column_bit(index)
            )
        })
        .collect::<Vec<_>>()
        .join(" + ");
    let any_changed = quoted
        .columns
        .iter()
        .map(String::as_str)
        .map(changed)
        .collect::<Vec<_>>()
        .join(" OR ");

    let update_trigger = format!(
        "CREATE TRIGGER {trigger}
AFTER UPDATE ON {table}
FOR EACH ROW
BEGIN
    INSERT INTO {history_table} ({insert_columns})
    SELECT old.{rowid},
{changed_values},
        {next_version},
        {now},
        {mask_terms}
    WHERE {any_changed};
END;
",
        trigger = quoted.update_trigger,
        rowid = quoted.rowid,
        table = quoted.table,
        history_table = quoted.history_table,
        next_version = quoted.next_version(),
    );

    let delete_trigger = format!(
        "CREATE TRIGGER {trigger}
AFTER DELETE ON {table}
BEGIN
    INSERT INTO {history_table} ({insert_columns})
    VALUES (
        old.{rowid},
        {old_values},
        {next_version},
        {now},
        {DELETE_MASK}
    );
END;
",
        trigger = quoted.delete_trigger,
        rowid = quoted.rowid,
        table = quoted.table,
        history_table = quoted.history_table,
        old_values = quoted.prefixed("old"),
        next_version = quoted.next_version(),
    );

    insert_trigger + &update_trigger + &delete_trigger
}

/// Copies every existing row into the history table as a version 1, full
/// mask event. Must run once, right after the triggers are installed and
/// before any other write to the table.
#[must_use]
pub fn backfill_sql(schema: &TableSchema, options: HistoryOptions) -> String {
    let quoted = Quoted::new(schema);
    format!(
        "INSERT INTO {history_table} ({insert_columns})
SELECT {rowid}, {columns}, 1, {now}, {mask}
FROM {table};
",
        history_table = quoted.history_table,
        insert_columns = quoted.insert_columns(),
        rowid = quoted.rowid,
        columns = quoted.columns.join(", "),
        now = options.timestamp.now_sql(),
        mask = schema.full_mask(),
        table = quoted.table,
    )
}

/// Everything needed to put a table under history, in execution order.
#[must_use]
pub fn configure_sql(schema: &TableSchema, options: HistoryOptions) -> String {
    history_table_sql(schema) + &triggers_sql(schema, options) + &backfill_sql(schema, options)
}
