//! Introspected source table structure.
//!
//! [`TableSchema`] is what the sync engine reads out of
//! `information_schema` and reproduces on the target with generated DDL.
//! Character set and collation are carried per column and per table so
//! string-typed columns keep the source encoding.

use serde::{Deserialize, Serialize};

/// One column as reported by `information_schema.columns`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    /// Full column type, e.g. `varchar(255)` or `decimal(10,2) unsigned`.
    pub column_type: String,
    pub nullable: bool,
    /// Default value expression, if any.
    #[serde(default)]
    pub default: Option<String>,
    /// Extra flags such as `auto_increment` or `on update CURRENT_TIMESTAMP`.
    #[serde(default)]
    pub extra: String,
    #[serde(default)]
    pub charset: Option<String>,
    #[serde(default)]
    pub collation: Option<String>,
}

/// One index, grouped from `information_schema.statistics`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    /// Columns in sequence order.
    pub columns: Vec<String>,
    pub unique: bool,
    /// Index method, e.g. `BTREE`.
    #[serde(default)]
    pub index_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Primary,
    Unique,
    Foreign,
}

/// One key constraint from `information_schema.key_column_usage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySchema {
    pub name: String,
    pub kind: KeyKind,
    pub columns: Vec<String>,
}

/// Full description of one source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    /// Columns in ordinal position order.
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
    #[serde(default)]
    pub keys: Vec<KeySchema>,
    #[serde(default)]
    pub charset: Option<String>,
    #[serde(default)]
    pub collation: Option<String>,
}

impl TableSchema {
    /// The primary key constraint, if the table has one.
    pub fn primary_key(&self) -> Option<&KeySchema> {
        self.keys.iter().find(|k| k.kind == KeyKind::Primary)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Columns excluded from checksum validation (no stable text rendering).
    pub fn is_lob_column(column_type: &str) -> bool {
        let t = column_type.to_ascii_lowercase();
        t.contains("blob") || t.contains("text") || t.contains("binary")
    }
}
