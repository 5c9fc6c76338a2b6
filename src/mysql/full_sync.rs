//! Full table refresh: drop, recreate, reload.

use anyhow::{bail, Context, Result};
use checkpoint::TableCheckpoint;
use mysql_async::prelude::Queryable;
use mysql_async::Conn;
use sync_core::ident::quote_qualified;
use sync_core::{ConnectionDescriptor, SyncConfig, SyncJob, TableMapping};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::batch::{adaptive_batch_size, BatchProcessor, InsertMode, BATCH_TIMEOUT};
use crate::mysql::stream::{MysqlBatchSink, MysqlRowFeed};
use crate::mysql::{change_tracking, ddl, schema, SyncContext};
use crate::optimize::{schema_key, Compressor};
use crate::sync::TableOutcome;

/// Run a full refresh of one mapping.
pub async fn run(
    ctx: &SyncContext,
    token: &CancellationToken,
    job: &SyncJob,
    config: &SyncConfig,
    mapping: &TableMapping,
) -> Result<TableOutcome> {
    let source = ctx.resolve_connection(&config.source_connection_id).await?;
    let target = ctx.resolve_connection(&config.target_connection_id).await?;
    let source_db = config.source_database.as_str();
    let target_db = config.effective_target_database();

    info!(
        job_id = %job.id,
        table = %mapping.source_table,
        "starting full sync into {target_db}.{}",
        mapping.target_table
    );

    // The target database is created through an admin connection that is
    // not bound to any schema.
    let (admin_key, mut admin) = ctx.pool.get(token, &target, None).await?;
    let ensured = admin
        .query_drop(ddl::create_database_sql(target_db))
        .await
        .context("failed to ensure target database");
    ctx.pool.release(&admin_key, admin);
    ensured?;

    let (src_key, mut src) = ctx.pool.get(token, &source, Some(source_db)).await?;
    let (dst_key, mut dst) = match ctx.pool.get(token, &target, Some(target_db)).await {
        Ok(pair) => pair,
        Err(e) => {
            ctx.pool.release(&src_key, src);
            return Err(e);
        }
    };

    let result = transfer(
        ctx, token, job, config, mapping, &source, &mut src, &mut dst, source_db, target_db,
    )
    .await;

    ctx.pool.release(&src_key, src);
    ctx.pool.release(&dst_key, dst);
    result
}

#[allow(clippy::too_many_arguments)]
async fn transfer(
    ctx: &SyncContext,
    token: &CancellationToken,
    job: &SyncJob,
    config: &SyncConfig,
    mapping: &TableMapping,
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

    let total_rows = schema::count_rows(
        src,
        source_db,
        &mapping.source_table,
        mapping.filter.as_deref(),
    )
    .await?;

    // Fresh target table: drop whatever is there and reproduce the source
    // schema.
    dst.query_drop(ddl::drop_table_sql(target_db, &mapping.target_table))
        .await
        .context("failed to drop target table")?;
    dst.query_drop(ddl::create_table_sql(target_db, &mapping.target_table, &schema))
        .await
        .context("failed to create target table")?;

    let batch_size = adaptive_batch_size(config.options.batch_size, total_rows, ctx.memory.available());
    let columns = schema.column_names();
    debug!(table = %mapping.source_table, total_rows, batch_size, "starting transfer");

    let mut select = format!(
        "SELECT * FROM {}",
        quote_qualified(source_db, &mapping.source_table)
    );
    if let Some(filter) = &mapping.filter {
        select.push_str(&format!(" WHERE ({filter})"));
    }

    let compressor = config.options.compress.then(Compressor::default);
    let processor = BatchProcessor {
        batch_size,
        timeout: BATCH_TIMEOUT,
        limiter: &*ctx.limiter,
        memory: &*ctx.memory,
        compressor: compressor.as_ref(),
        dry_run: config.options.dry_run,
    };

    let report = {
        let query_result = src.query_iter(select).await?;
        let mut feed = MysqlRowFeed::new(query_result);
        let mut sink = MysqlBatchSink::new(dst);
        processor
            .run(
                token,
                &mut feed,
                &mut sink,
                target_db,
                &mapping.target_table,
                &columns,
                InsertMode::Plain,
                |processed, failed| {
                    debug!(table = %mapping.target_table, processed, failed, "batch done");
                },
            )
            .await?
    };

    if report.cancelled {
        return Ok(TableOutcome {
            rows_processed: report.processed_rows,
            rows_total: total_rows,
            cancelled: true,
        });
    }
    if report.failed_rows > 0 {
        bail!(
            "full sync of {}: {} of {} rows failed to insert",
            mapping.source_table,
            report.failed_rows,
            report.total_rows
        );
    }

    // Seed the incremental resume point when the table supports one.
    if let Some(change) = change_tracking::detect(&schema) {
        let raw =
            schema::max_column_value(src, source_db, &mapping.source_table, &change.name).await?;
        let mut checkpoint = TableCheckpoint::new(mapping.id.clone());
        checkpoint.last_value = raw.map(|r| change_tracking::to_checkpoint_value(change.kind, &r));
        checkpoint.processed_rows = report.processed_rows;
        checkpoint.total_rows = total_rows;
        checkpoint.batch_number = report.batches;
        ctx.checkpoints.save_table(&checkpoint).await?;
    }

    info!(
        job_id = %job.id,
        table = %mapping.source_table,
        rows = report.processed_rows,
        batches = report.batches,
        "full sync completed at {:.0} rows/s",
        report.rows_per_sec
    );
    ctx.sink
        .log_event(
            &job.id,
            Some(&mapping.source_table),
            "info",
            &format!("full sync copied {} rows", report.processed_rows),
        )
        .await;

    Ok(TableOutcome {
        rows_processed: report.processed_rows,
        rows_total: total_rows,
        cancelled: false,
    })
}
