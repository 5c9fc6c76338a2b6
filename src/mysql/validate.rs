//! Post-sync consistency validation.
//!
//! Two checks, in order: row-count equality under the mapping's filter,
//! then (deep mode) a pairwise MD5 comparison of both row streams ordered
//! by primary key. BLOB/TEXT columns are excluded from the checksum; they
//! have no stable text rendering to hash.

use anyhow::{bail, Context, Result};
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Value};
use sync_core::ident::{quote_ident, quote_qualified};
use sync_core::{ConnectionDescriptor, SyncConfig, TableMapping, TableSchema};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::batch::RowFeed;
use crate::mysql::stream::MysqlRowFeed;
use crate::mysql::{schema, SyncContext};
use crate::optimize::schema_key;

/// Validate one mapping after a sync.
pub async fn run(
    ctx: &SyncContext,
    token: &CancellationToken,
    config: &SyncConfig,
    mapping: &TableMapping,
    deep: bool,
) -> Result<()> {
    let source = ctx.resolve_connection(&config.source_connection_id).await?;
    let target = ctx.resolve_connection(&config.target_connection_id).await?;
    let source_db = config.source_database.as_str();
    let target_db = config.effective_target_database();

    let (src_key, mut src) = ctx.pool.get(token, &source, Some(source_db)).await?;
    let (dst_key, mut dst) = match ctx.pool.get(token, &target, Some(target_db)).await {
        Ok(pair) => pair,
        Err(e) => {
            ctx.pool.release(&src_key, src);
            return Err(e);
        }
    };

    let result = check(
        ctx, token, mapping, &source, &mut src, &mut dst, source_db, target_db, deep,
    )
    .await;

    ctx.pool.release(&src_key, src);
    ctx.pool.release(&dst_key, dst);
    result
}

#[allow(clippy::too_many_arguments)]
async fn check(
    ctx: &SyncContext,
    token: &CancellationToken,
    mapping: &TableMapping,
    source: &ConnectionDescriptor,
    src: &mut Conn,
    dst: &mut Conn,
    source_db: &str,
    target_db: &str,
    deep: bool,
) -> Result<()> {
    let source_count = schema::count_rows(
        src,
        source_db,
        &mapping.source_table,
        mapping.filter.as_deref(),
    )
    .await?;
    let target_count =
        schema::count_rows(dst, target_db, &mapping.target_table, None).await?;

    if source_count != target_count {
        bail!("row count mismatch: source={source_count}, target={target_count}");
    }
    if !deep {
        info!(
            table = %mapping.source_table,
            rows = source_count,
            "row count validation passed"
        );
        return Ok(());
    }

    let table_schema = ctx
        .schemas
        .get_or_fetch(&schema_key(&source.id, &mapping.source_table), || {
            schema::introspect(&mut *src, source_db, &mapping.source_table)
        })
        .await?;

    let primary_key = table_schema
        .primary_key()
        .context("deep validation requires a primary key to order rows by")?;
    let columns: Vec<String> = table_schema
        .columns
        .iter()
        .filter(|c| !TableSchema::is_lob_column(&c.column_type))
        .map(|c| c.name.clone())
        .collect();
    if columns.is_empty() {
        bail!(
            "table {} has no checksum-comparable columns",
            mapping.source_table
        );
    }

    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let order_by = primary_key
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut src_sql = format!(
        "SELECT {column_list} FROM {}",
        quote_qualified(source_db, &mapping.source_table)
    );
    if let Some(filter) = &mapping.filter {
        src_sql.push_str(&format!(" WHERE ({filter})"));
    }
    src_sql.push_str(&format!(" ORDER BY {order_by}"));
    let dst_sql = format!(
        "SELECT {column_list} FROM {} ORDER BY {order_by}",
        quote_qualified(target_db, &mapping.target_table)
    );

    let mut src_rows = MysqlRowFeed::new(src.query_iter(src_sql).await?);
    let mut dst_rows = MysqlRowFeed::new(dst.query_iter(dst_sql).await?);

    let mut row = 0u64;
    loop {
        if token.is_cancelled() {
            bail!("validation cancelled");
        }
        // Pull both sides in parallel; the streams advance in lockstep.
        let pair = futures::future::try_join(src_rows.next_row(), dst_rows.next_row()).await?;
        match pair {
            (None, None) => break,
            (Some(_), None) | (None, Some(_)) => {
                bail!("checksum stream length mismatch after {row} rows")
            }
            (Some(a), Some(b)) => {
                let (left, right) = (row_checksum(&a), row_checksum(&b));
                if left != right {
                    bail!("checksum mismatch at row {row}: source={left}, target={right}");
                }
            }
        }
        row += 1;
    }

    info!(
        table = %mapping.source_table,
        rows = row,
        "deep validation passed"
    );
    Ok(())
}

/// MD5 over the pipe-joined text forms of one row, NULLs rendered as the
/// literal `NULL`.
pub fn row_checksum(row: &[Value]) -> String {
    let joined = row.iter().map(value_text).collect::<Vec<_>>().join("|");
    format!("{:x}", md5::compute(joined.as_bytes()))
}

fn value_text(value: &Value) -> String {
    match value {
        Value::NULL => "NULL".to_string(),
        Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Double(d) => d.to_string(),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            if *micros > 0 {
                format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
                )
            } else {
                format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}")
            }
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let total_hours = u32::from(*days) * 24 + u32::from(*hours);
            if *micros > 0 {
                format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}.{micros:06}")
            } else {
                format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_renders_as_literal() {
        assert_eq!(value_text(&Value::NULL), "NULL");
    }

    #[test]
    fn test_datetime_rendering() {
        assert_eq!(
            value_text(&Value::Date(2026, 3, 1, 12, 30, 5, 0)),
            "2026-03-01 12:30:05"
        );
        assert_eq!(
            value_text(&Value::Date(2026, 3, 1, 12, 30, 5, 120000)),
            "2026-03-01 12:30:05.120000"
        );
    }

    #[test]
    fn test_checksum_is_deterministic_and_discriminating() {
        let a = vec![Value::Int(1), Value::Bytes(b"alice".to_vec())];
        let b = vec![Value::Int(1), Value::Bytes(b"alicf".to_vec())];

        assert_eq!(row_checksum(&a), row_checksum(&a));
        assert_ne!(row_checksum(&a), row_checksum(&b));
    }

    #[test]
    fn test_checksum_matches_across_equal_rows() {
        let a = vec![
            Value::Int(7),
            Value::NULL,
            Value::Date(2026, 1, 2, 3, 4, 5, 0),
        ];
        let b = a.clone();
        assert_eq!(row_checksum(&a), row_checksum(&b));
    }
}
