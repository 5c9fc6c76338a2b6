//! Target DDL generation from an introspected schema.
//!
//! The generated CREATE TABLE reproduces columns (type, nullability,
//! default, extra flags, per-column charset/collation), the primary key,
//! unique keys, secondary indexes and the table-level charset/collation.
//! Foreign keys are not carried over; the target is a sync mirror, not a
//! relationally-enforced replica.

use sync_core::ident::{quote_ident, quote_qualified};
use sync_core::{ColumnSchema, TableSchema};

pub fn create_database_sql(database: &str) -> String {
    format!("CREATE DATABASE IF NOT EXISTS {}", quote_ident(database))
}

pub fn drop_table_sql(database: &str, table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_qualified(database, table))
}

/// CREATE TABLE statement for `table` in `database`, mirroring `schema`.
///
/// `table` may differ from `schema.name` when the mapping renames the
/// target table.
pub fn create_table_sql(database: &str, table: &str, schema: &TableSchema) -> String {
    let mut parts: Vec<String> = schema.columns.iter().map(column_definition).collect();

    if let Some(pk) = schema.primary_key() {
        parts.push(format!("PRIMARY KEY ({})", column_list(&pk.columns)));
    }
    for index in &schema.indexes {
        let kind = if index.unique { "UNIQUE KEY" } else { "KEY" };
        parts.push(format!(
            "{kind} {} ({})",
            quote_ident(&index.name),
            column_list(&index.columns)
        ));
    }

    let mut statement = format!(
        "CREATE TABLE {} (\n  {}\n)",
        quote_qualified(database, table),
        parts.join(",\n  ")
    );

    statement.push_str(" ENGINE=InnoDB");
    if let Some(charset) = &schema.charset {
        statement.push_str(&format!(" DEFAULT CHARSET={charset}"));
    }
    if let Some(collation) = &schema.collation {
        statement.push_str(&format!(" COLLATE={collation}"));
    }

    statement
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_definition(column: &ColumnSchema) -> String {
    let mut def = format!("{} {}", quote_ident(&column.name), column.column_type);

    if let Some(charset) = &column.charset {
        def.push_str(&format!(" CHARACTER SET {charset}"));
    }
    if let Some(collation) = &column.collation {
        def.push_str(&format!(" COLLATE {collation}"));
    }

    def.push_str(if column.nullable { " NULL" } else { " NOT NULL" });

    if let Some(default) = render_default(column) {
        def.push_str(&format!(" DEFAULT {default}"));
    }

    let extra = render_extra(&column.extra);
    if !extra.is_empty() {
        def.push_str(&format!(" {extra}"));
    }

    def
}

/// Render the column default the way it must appear in DDL.
///
/// Expression defaults (CURRENT_TIMESTAMP and friends, and anything the
/// server marked DEFAULT_GENERATED) and numeric literals pass through
/// verbatim; everything else becomes a quoted string literal.
fn render_default(column: &ColumnSchema) -> Option<String> {
    let default = column.default.as_deref()?;

    if default.eq_ignore_ascii_case("NULL") {
        return Some("NULL".to_string());
    }
    let generated = column
        .extra
        .to_ascii_uppercase()
        .contains("DEFAULT_GENERATED");
    if generated || default.to_ascii_uppercase().starts_with("CURRENT_TIMESTAMP") {
        return Some(default.to_string());
    }
    if default.parse::<f64>().is_ok() {
        return Some(default.to_string());
    }

    Some(format!("'{}'", default.replace('\'', "''")))
}

/// Normalize the EXTRA flags for DDL.
///
/// DEFAULT_GENERATED is bookkeeping in the information schema, not DDL
/// syntax, so it is dropped; auto_increment is uppercased.
fn render_extra(extra: &str) -> String {
    extra
        .split_whitespace()
        .filter(|tok| !tok.eq_ignore_ascii_case("DEFAULT_GENERATED"))
        .map(|tok| {
            if tok.eq_ignore_ascii_case("auto_increment") {
                "AUTO_INCREMENT".to_string()
            } else {
                tok.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
