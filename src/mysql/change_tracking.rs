//! Change-tracking column detection for incremental sync.
//!
//! Detection is pure metadata inspection, no data scan. Preference order:
//! a conventionally named timestamp column, then any datetime/timestamp
//! column whose name mentions updates, then an auto-increment column. A
//! table offering none of these cannot sync incrementally.

use sync_core::TableSchema;

/// Conventional update-timestamp column names, most specific first.
const TIMESTAMP_NAMES: [&str; 3] = ["updated_at", "modified_at", "last_modified"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeColumnKind {
    /// Values stored as ISO-formatted timestamp strings.
    Timestamp,
    /// Values stored as decimal integer strings.
    AutoIncrement,
}

/// The column incremental sync orders and filters by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeColumn {
    pub name: String,
    pub kind: ChangeColumnKind,
}

/// Detect the change-tracking column of `schema`, if any.
pub fn detect(schema: &TableSchema) -> Option<ChangeColumn> {
    for candidate in TIMESTAMP_NAMES {
        if let Some(column) = schema
            .columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(candidate))
        {
            return Some(ChangeColumn {
                name: column.name.clone(),
                kind: ChangeColumnKind::Timestamp,
            });
        }
    }

    if let Some(column) = schema.columns.iter().find(|c| {
        let t = c.column_type.to_ascii_lowercase();
        (t.starts_with("datetime") || t.starts_with("timestamp"))
            && c.name.to_ascii_lowercase().contains("update")
    }) {
        return Some(ChangeColumn {
            name: column.name.clone(),
            kind: ChangeColumnKind::Timestamp,
        });
    }

    schema
        .columns
        .iter()
        .find(|c| c.extra.to_ascii_lowercase().contains("auto_increment"))
        .map(|column| ChangeColumn {
            name: column.name.clone(),
            kind: ChangeColumnKind::AutoIncrement,
        })
}

/// Render a server-reported max value into checkpoint form.
///
/// Timestamps are stored ISO-formatted (`T` separator); integers pass
/// through as decimal strings.
pub fn to_checkpoint_value(kind: ChangeColumnKind, raw: &str) -> String {
    match kind {
        ChangeColumnKind::Timestamp => raw.replacen(' ', "T", 1),
        ChangeColumnKind::AutoIncrement => raw.to_string(),
    }
}

/// Render a checkpoint value back into a comparable query parameter.
pub fn to_query_value(kind: ChangeColumnKind, stored: &str) -> String {
    match kind {
        ChangeColumnKind::Timestamp => stored.replacen('T', " ", 1),
        ChangeColumnKind::AutoIncrement => stored.to_string(),
    }
}
