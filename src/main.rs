//! Command-line interface for mysql-sync.
//!
//! # Usage Examples
//!
//! ```bash
//! # Run one sync job from a config file
//! mysql-sync run --config sync.yaml
//!
//! # Throttle outbound transfer to 5 MB/s
//! mysql-sync run --config sync.yaml --rate-limit 5242880
//!
//! # Check that synced tables still match the source, row by row
//! mysql-sync validate --config sync.yaml --deep
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use checkpoint::CheckpointManager;
use clap::{Args, Parser, Subcommand};
use sync_core::{JobStatus, SyncJob};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mysql_sync::batch::MemoryMonitor;
use mysql_sync::engine::{EngineConfig, JobEngine};
use mysql_sync::executor::JobExecutor;
use mysql_sync::mysql::connector::MysqlConnector;
use mysql_sync::mysql::{MysqlTableSyncer, SyncContext, DEFAULT_MEMORY_BUDGET};
use mysql_sync::optimize::cache::DEFAULT_SCHEMA_TTL;
use mysql_sync::optimize::{cache, pool, ConnectionPool, RateLimiter, SchemaCache};
use mysql_sync::progress::LoggingProgressSink;
use mysql_sync::retry::RetryPolicy;
use mysql_sync::store::{ConfigStore, MemoryConfigStore};
use mysql_sync::sync::TableSyncer;

#[derive(Parser)]
#[command(
    name = "mysql-sync",
    about = "Synchronize MySQL tables from a remote source into a local target"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync job defined by a config file
    Run(RunArgs),
    /// Validate synced tables against the source
    Validate(ValidateArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Path to the YAML config file
    #[arg(long, env = "MYSQL_SYNC_CONFIG")]
    config: PathBuf,

    /// Outbound rate limit in bytes/sec; 0 disables the limiter
    #[arg(long, default_value = "0", env = "MYSQL_SYNC_RATE_LIMIT")]
    rate_limit: u64,

    /// Token bucket burst in bytes
    #[arg(long, default_value = "1048576")]
    rate_burst: u64,

    /// Memory budget for transfer buffers, in bytes
    #[arg(long, default_value_t = DEFAULT_MEMORY_BUDGET)]
    memory_budget: u64,

    /// Worker pool size
    #[arg(long, default_value = "5")]
    workers: usize,
}

#[derive(Args)]
struct ValidateArgs {
    /// Path to the YAML config file
    #[arg(long, env = "MYSQL_SYNC_CONFIG")]
    config: PathBuf,

    /// Also compare per-row checksums, ordered by primary key
    #[arg(long)]
    deep: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_job(args).await?,
        Commands::Validate(args) => run_validation(args).await?,
    }

    Ok(())
}

/// Wire the store, optimizer and engine together for one process.
struct Runtime {
    store: Arc<MemoryConfigStore>,
    ctx_token: CancellationToken,
    syncer: Arc<MysqlTableSyncer>,
    executor: Arc<JobExecutor>,
    config_id: String,
}

async fn build_runtime(
    config_path: &std::path::Path,
    rate_limit: u64,
    rate_burst: u64,
    memory_budget: u64,
) -> Result<Runtime> {
    let file = mysql_sync::config::load(config_path)?;
    let config_id = file.sync.id.clone();

    let store = Arc::new(MemoryConfigStore::new());
    for connection in file.connections {
        store.put_connection(connection).await?;
    }
    store.put_sync_config(file.sync.clone()).await?;

    let ctx_token = CancellationToken::new();
    let connection_pool = Arc::new(ConnectionPool::with_defaults(MysqlConnector::new(
        file.sync.options.compress,
    )));
    let schemas = Arc::new(SchemaCache::new(DEFAULT_SCHEMA_TTL));
    let _ = pool::spawn_sweeper(connection_pool.clone(), ctx_token.clone());
    let _ = cache::spawn_sweeper(schemas.clone(), ctx_token.clone());

    let checkpoints = CheckpointManager::new(store.clone());
    let sink = Arc::new(LoggingProgressSink);
    let ctx = SyncContext {
        store: store.clone(),
        checkpoints: checkpoints.clone(),
        sink: sink.clone(),
        pool: connection_pool,
        schemas,
        limiter: Arc::new(RateLimiter::new(rate_limit, rate_burst)),
        memory: Arc::new(MemoryMonitor::new(memory_budget)),
    };
    let syncer = Arc::new(MysqlTableSyncer::new(ctx));
    let executor = Arc::new(JobExecutor::new(
        store.clone(),
        checkpoints,
        sink,
        syncer.clone(),
        RetryPolicy::default(),
    ));

    Ok(Runtime {
        store,
        ctx_token,
        syncer,
        executor,
        config_id,
    })
}

async fn run_job(args: RunArgs) -> Result<()> {
    let runtime = build_runtime(&args.config, args.rate_limit, args.rate_burst, args.memory_budget)
        .await?;

    let engine = JobEngine::start(
        runtime.store.clone(),
        runtime.executor.clone(),
        EngineConfig {
            workers: args.workers,
            ..EngineConfig::default()
        },
    );

    let job = SyncJob::new(Uuid::new_v4().to_string(), runtime.config_id.clone());
    let job_id = engine.submit(job).await?;
    tracing::info!(job_id, "job submitted");

    // Wait for the terminal status, translating Ctrl-C into a cancel.
    let finished = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!(job_id, "interrupt received, cancelling job");
                let _ = engine.cancel(&job_id).await;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }

        if let Some(job) = runtime.store.get_job(&job_id).await? {
            if job.status.is_terminal() {
                break job;
            }
        }
    };

    engine.shutdown().await;
    runtime.ctx_token.cancel();

    match finished.status {
        JobStatus::Completed => {
            tracing::info!(
                tables = finished.progress.completed_tables,
                rows = finished.progress.processed_rows,
                "sync completed"
            );
            tracing::debug!("job record: {}", serde_json::to_string(&finished)?);
            if let Some(warning) = finished.last_error {
                tracing::warn!("{warning}");
            }
            Ok(())
        }
        status => {
            let reason = finished.last_error.unwrap_or_else(|| "unknown error".to_string());
            bail!("job {job_id} ended {status}: {reason}")
        }
    }
}

async fn run_validation(args: ValidateArgs) -> Result<()> {
    let runtime = build_runtime(&args.config, 0, 0, DEFAULT_MEMORY_BUDGET).await?;
    let config = runtime
        .store
        .get_sync_config(&runtime.config_id)
        .await?
        .expect("config loaded at startup");

    let token = CancellationToken::new();
    let mut failures = 0usize;
    for mapping in config.enabled_mappings() {
        match runtime
            .syncer
            .validate(&token, &config, mapping, args.deep)
            .await
        {
            Ok(()) => tracing::info!(table = %mapping.source_table, "validation passed"),
            Err(e) => {
                failures += 1;
                tracing::error!(table = %mapping.source_table, "validation failed: {e:#}");
            }
        }
    }

    runtime.ctx_token.cancel();
    if failures > 0 {
        bail!("{failures} tables failed validation");
    }
    Ok(())
}
