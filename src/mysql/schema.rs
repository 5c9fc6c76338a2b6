//! Source schema introspection.
//!
//! Four metadata queries against the information-schema views: columns in
//! ordinal order (with charset and collation), indexes grouped by name in
//! sequence order, key constraints, and the table-level charset/collation.
//! No data pages are touched.

use anyhow::{bail, Result};
use mysql_async::prelude::Queryable;
use mysql_async::Conn;
use sync_core::ident::{quote_ident, quote_qualified};
use sync_core::{ColumnSchema, IndexSchema, KeyKind, KeySchema, TableSchema};

type ColumnRow = (
    String,         // COLUMN_NAME
    String,         // COLUMN_TYPE
    String,         // IS_NULLABLE
    Option<String>, // COLUMN_DEFAULT
    String,         // EXTRA
    Option<String>, // CHARACTER_SET_NAME
    Option<String>, // COLLATION_NAME
);

type IndexRow = (String, String, i64, String); // INDEX_NAME, COLUMN_NAME, NON_UNIQUE, INDEX_TYPE

type KeyRow = (String, String, String); // CONSTRAINT_NAME, CONSTRAINT_TYPE, COLUMN_NAME

/// Introspect one table of `database`.
pub async fn introspect(conn: &mut Conn, database: &str, table: &str) -> Result<TableSchema> {
    let column_rows: Vec<ColumnRow> = conn
        .exec(
            "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_DEFAULT, EXTRA,
                    CHARACTER_SET_NAME, COLLATION_NAME
             FROM information_schema.COLUMNS
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
             ORDER BY ORDINAL_POSITION",
            (database, table),
        )
        .await?;

    if column_rows.is_empty() {
        bail!("table doesn't exist: {database}.{table}");
    }

    let index_rows: Vec<IndexRow> = conn
        .exec(
            "SELECT INDEX_NAME, COLUMN_NAME, NON_UNIQUE, INDEX_TYPE
             FROM information_schema.STATISTICS
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
             ORDER BY INDEX_NAME, SEQ_IN_INDEX",
            (database, table),
        )
        .await?;

    let key_rows: Vec<KeyRow> = conn
        .exec(
            "SELECT tc.CONSTRAINT_NAME, tc.CONSTRAINT_TYPE, kcu.COLUMN_NAME
             FROM information_schema.TABLE_CONSTRAINTS tc
             JOIN information_schema.KEY_COLUMN_USAGE kcu
               ON tc.CONSTRAINT_SCHEMA = kcu.CONSTRAINT_SCHEMA
              AND tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME
              AND tc.TABLE_NAME = kcu.TABLE_NAME
             WHERE tc.TABLE_SCHEMA = ? AND tc.TABLE_NAME = ?
               AND tc.CONSTRAINT_TYPE IN ('PRIMARY KEY', 'UNIQUE', 'FOREIGN KEY')
             ORDER BY tc.CONSTRAINT_NAME, kcu.ORDINAL_POSITION",
            (database, table),
        )
        .await?;

    let table_row: Option<(Option<String>, Option<String>)> = conn
        .exec_first(
            "SELECT ccsa.CHARACTER_SET_NAME, t.TABLE_COLLATION
             FROM information_schema.TABLES t
             LEFT JOIN information_schema.COLLATION_CHARACTER_SET_APPLICABILITY ccsa
               ON t.TABLE_COLLATION = ccsa.COLLATION_NAME
             WHERE t.TABLE_SCHEMA = ? AND t.TABLE_NAME = ?",
            (database, table),
        )
        .await?;

    let (charset, collation) = table_row.unwrap_or((None, None));

    Ok(TableSchema {
        name: table.to_string(),
        columns: build_columns(column_rows),
        indexes: group_indexes(index_rows),
        keys: group_keys(key_rows),
        charset,
        collation,
    })
}

/// Whether `database.table` exists.
pub async fn table_exists(conn: &mut Conn, database: &str, table: &str) -> Result<bool> {
    let count: Option<u64> = conn
        .exec_first(
            "SELECT COUNT(*) FROM information_schema.TABLES
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
            (database, table),
        )
        .await?;
    Ok(count.unwrap_or(0) > 0)
}

/// `COUNT(*)` under the mapping's filter predicate.
pub async fn count_rows(
    conn: &mut Conn,
    database: &str,
    table: &str,
    filter: Option<&str>,
) -> Result<u64> {
    let mut query = format!("SELECT COUNT(*) FROM {}", quote_qualified(database, table));
    if let Some(filter) = filter {
        query.push_str(&format!(" WHERE ({filter})"));
    }
    let count: Option<u64> = conn.query_first(query).await?;
    Ok(count.unwrap_or(0))
}

/// Current maximum of one column, rendered as a string by the server.
pub async fn max_column_value(
    conn: &mut Conn,
    database: &str,
    table: &str,
    column: &str,
) -> Result<Option<String>> {
    let query = format!(
        "SELECT CAST(MAX({}) AS CHAR) FROM {}",
        quote_ident(column),
        quote_qualified(database, table)
    );
    let value: Option<Option<String>> = conn.query_first(query).await?;
    Ok(value.flatten())
}

fn build_columns(rows: Vec<ColumnRow>) -> Vec<ColumnSchema> {
    rows.into_iter()
        .map(
            |(name, column_type, is_nullable, default, extra, charset, collation)| ColumnSchema {
                name,
                column_type,
                nullable: is_nullable.eq_ignore_ascii_case("YES"),
                default,
                extra,
                charset,
                collation,
            },
        )
        .collect()
}

/// Group statistics rows into indexes, preserving column sequence.
///
/// The PRIMARY index is skipped here; it arrives through the key
/// constraints instead.
fn group_indexes(rows: Vec<IndexRow>) -> Vec<IndexSchema> {
    let mut indexes: Vec<IndexSchema> = Vec::new();

    for (name, column, non_unique, index_type) in rows {
        if name == "PRIMARY" {
            continue;
        }
        match indexes.iter_mut().find(|i| i.name == name) {
            Some(index) => index.columns.push(column),
            None => indexes.push(IndexSchema {
                name,
                columns: vec![column],
                unique: non_unique == 0,
                index_type,
            }),
        }
    }

    indexes
}

fn group_keys(rows: Vec<KeyRow>) -> Vec<KeySchema> {
    let mut keys: Vec<KeySchema> = Vec::new();

    for (name, constraint_type, column) in rows {
        let kind = match constraint_type.as_str() {
            "PRIMARY KEY" => KeyKind::Primary,
            "UNIQUE" => KeyKind::Unique,
            _ => KeyKind::Foreign,
        };
        match keys.iter_mut().find(|k| k.name == name && k.kind == kind) {
            Some(key) => key.columns.push(column),
            None => keys.push(KeySchema {
                name,
                kind,
                columns: vec![column],
            }),
        }
    }

    keys
}
