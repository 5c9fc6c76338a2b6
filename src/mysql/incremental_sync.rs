//! Incremental delta sync driven by the change-tracking column.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Value};
use sync_core::ident::{quote_ident, quote_qualified};
use sync_core::{ConnectionDescriptor, SyncConfig, SyncJob, TableMapping};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::batch::{adaptive_batch_size, BatchProcessor, InsertMode, RowFeed, BATCH_TIMEOUT};
use crate::classify::ClassifiedError;
use crate::mysql::stream::{MysqlBatchSink, MysqlRowFeed};
use crate::mysql::{change_tracking, ddl, full_sync, schema, SyncContext};
use crate::optimize::{schema_key, Compressor};
use crate::sync::TableOutcome;

/// Apply the delta since the mapping's table checkpoint.
///
/// Without a checkpoint the mapping has never fully synced, so this falls
/// back to a full refresh (which seeds the checkpoint).
pub async fn run(
    ctx: &SyncContext,
    token: &CancellationToken,
    job: &SyncJob,
    config: &SyncConfig,
    mapping: &TableMapping,
) -> Result<TableOutcome> {
    let Some(existing) = ctx.checkpoints.load_table(&mapping.id).await? else {
        debug!(
            table = %mapping.source_table,
            "no table checkpoint; falling back to full sync"
        );
        return full_sync::run(ctx, token, job, config, mapping).await;
    };

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

    let result = apply_delta(
        ctx, token, job, config, mapping, existing, &source, &mut src, &mut dst, source_db,
        target_db,
    )
    .await;

    ctx.pool.release(&src_key, src);
    ctx.pool.release(&dst_key, dst);
    result
}

#[allow(clippy::too_many_arguments)]
async fn apply_delta(
    ctx: &SyncContext,
    token: &CancellationToken,
    job: &SyncJob,
    config: &SyncConfig,
    mapping: &TableMapping,
    mut checkpoint: checkpoint::TableCheckpoint,
    source: &ConnectionDescriptor,
    src: &mut Conn,
    dst: &mut Conn,
    source_db: &str,
    target_db: &str,
) -> Result<TableOutcome> {
    let schema = ctx
        .schemas
        .get_or_fetch(&schema_key(&source.id, &mapping.source_table), || {
            schema::introspect(&mut *src, source_db, &mapping.source_table)
        })
        .await?;

    let change = change_tracking::detect(&schema).ok_or_else(|| {
        anyhow::Error::new(ClassifiedError::schema_conflict(format!(
            "table {} has no usable change tracking column; incremental sync is not supported",
            mapping.source_table
        )))
    })?;
    let primary_key = schema
        .primary_key()
        .ok_or_else(|| {
            anyhow::Error::new(ClassifiedError::schema_conflict(format!(
                "table {} has no primary key; incremental sync needs one for upserts",
                mapping.source_table
            )))
        })?
        .columns
        .clone();

    if !schema::table_exists(dst, target_db, &mapping.target_table).await? {
        dst.query_drop(ddl::create_table_sql(target_db, &mapping.target_table, &schema))
            .await
            .context("failed to create target table")?;
    }

    // Rows strictly after the checkpoint, in change-column order. A
    // checkpoint without a recorded value (the table was empty at full
    // sync) replays everything under the filter.
    let mut where_clause = String::new();
    let mut params: Vec<Value> = Vec::new();
    match &checkpoint.last_value {
        Some(stored) => {
            where_clause.push_str(&format!(" WHERE {} > ?", quote_ident(&change.name)));
            params.push(Value::from(change_tracking::to_query_value(
                change.kind,
                stored,
            )));
            if let Some(filter) = &mapping.filter {
                where_clause.push_str(&format!(" AND ({filter})"));
            }
        }
        None => {
            if let Some(filter) = &mapping.filter {
                where_clause.push_str(&format!(" WHERE ({filter})"));
            }
        }
    }

    let qualified = quote_qualified(source_db, &mapping.source_table);
    let count_sql = format!("SELECT COUNT(*) FROM {qualified}{where_clause}");
    let delta_rows: Option<u64> = if params.is_empty() {
        src.query_first(count_sql).await?
    } else {
        src.exec_first(count_sql, params.clone()).await?
    };
    let delta_rows = delta_rows.unwrap_or(0);

    let select = format!(
        "SELECT * FROM {qualified}{where_clause} ORDER BY {} ASC",
        quote_ident(&change.name)
    );

    let batch_size =
        adaptive_batch_size(config.options.batch_size, delta_rows, ctx.memory.available());
    let columns = schema.column_names();
    debug!(
        table = %mapping.source_table,
        delta_rows,
        batch_size,
        since = checkpoint.last_value.as_deref().unwrap_or("<start>"),
        "applying incremental delta"
    );

    let compressor = config.options.compress.then(Compressor::default);
    let processor = BatchProcessor {
        batch_size,
        timeout: BATCH_TIMEOUT,
        limiter: &*ctx.limiter,
        memory: &*ctx.memory,
        compressor: compressor.as_ref(),
        dry_run: config.options.dry_run,
    };
    let mode = InsertMode::Upsert {
        policy: config.options.conflict_policy,
        primary_key: &primary_key,
    };

    let report = {
        let mut feed: Box<dyn RowFeed + '_> = if params.is_empty() {
            Box::new(MysqlRowFeed::new(src.query_iter(select).await?))
        } else {
            Box::new(MysqlRowFeed::new(src.exec_iter(select, params).await?))
        };
        let mut sink = MysqlBatchSink::new(dst);
        processor
            .run(
                token,
                feed.as_mut(),
                &mut sink,
                target_db,
                &mapping.target_table,
                &columns,
                mode,
                |processed, failed| {
                    debug!(table = %mapping.target_table, processed, failed, "batch done");
                },
            )
            .await?
    };

    if report.cancelled {
        // The checkpoint is left where it was; the next run replays the
        // unfinished tail, which upserts make idempotent.
        return Ok(TableOutcome {
            rows_processed: report.processed_rows,
            rows_total: delta_rows,
            cancelled: true,
        });
    }
    if report.failed_rows > 0 {
        bail!(
            "incremental sync of {}: {} of {} rows failed to upsert",
            mapping.source_table,
            report.failed_rows,
            report.total_rows
        );
    }

    let raw = schema::max_column_value(src, source_db, &mapping.source_table, &change.name).await?;
    if let Some(raw) = raw {
        checkpoint.last_value = Some(change_tracking::to_checkpoint_value(change.kind, &raw));
    }
    checkpoint.processed_rows += report.processed_rows;
    checkpoint.total_rows = schema::count_rows(
        src,
        source_db,
        &mapping.source_table,
        mapping.filter.as_deref(),
    )
    .await?;
    checkpoint.batch_number += report.batches;
    checkpoint.updated_at = Utc::now();
    ctx.checkpoints.save_table(&checkpoint).await?;

    info!(
        job_id = %job.id,
        table = %mapping.source_table,
        rows = report.processed_rows,
        "incremental sync applied delta"
    );
    ctx.sink
        .log_event(
            &job.id,
            Some(&mapping.source_table),
            "info",
            &format!("incremental sync applied {} rows", report.processed_rows),
        )
        .await;

    Ok(TableOutcome {
        rows_processed: report.processed_rows,
        rows_total: delta_rows,
        cancelled: false,
    })
}
