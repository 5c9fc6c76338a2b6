//! MySQL table sync engine.
//!
//! One [`MysqlTableSyncer`] serves every job in the process: it owns no
//! per-job state, only handles to the shared pool, caches and checkpoint
//! manager collected in [`SyncContext`].

pub mod change_tracking;
pub mod connector;
pub mod ddl;
pub mod full_sync;
pub mod incremental_sync;
pub mod schema;
pub mod stream;
pub mod validate;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use checkpoint::CheckpointManager;
use mysql_async::Conn;
use sync_core::{ConnectionDescriptor, SyncConfig, SyncJob, SyncMode, TableMapping};
use tokio_util::sync::CancellationToken;

use crate::batch::MemoryMonitor;
use crate::optimize::{ConnectionPool, RateLimiter, SchemaCache};
use crate::progress::ProgressSink;
use crate::store::ConfigStore;
use crate::sync::{TableOutcome, TableSyncer};

use connector::MysqlConnector;

/// Default memory budget for transfer buffers.
pub const DEFAULT_MEMORY_BUDGET: u64 = 512 * 1024 * 1024;

/// Shared handles the sync pipeline runs against.
pub struct SyncContext {
    pub store: Arc<dyn ConfigStore>,
    pub checkpoints: CheckpointManager,
    pub sink: Arc<dyn ProgressSink>,
    pub pool: Arc<ConnectionPool<Conn, MysqlConnector>>,
    pub schemas: Arc<SchemaCache>,
    pub limiter: Arc<RateLimiter>,
    pub memory: Arc<MemoryMonitor>,
}

impl SyncContext {
    pub(crate) async fn resolve_connection(&self, id: &str) -> Result<ConnectionDescriptor> {
        self.store
            .get_connection(id)
            .await?
            .with_context(|| format!("unknown connection {id}"))
    }
}

/// Production [`TableSyncer`] backed by mysql connections.
pub struct MysqlTableSyncer {
    ctx: SyncContext,
}

impl MysqlTableSyncer {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TableSyncer for MysqlTableSyncer {
    async fn sync_table(
        &self,
        token: &CancellationToken,
        job: &SyncJob,
        config: &SyncConfig,
        mapping: &TableMapping,
    ) -> Result<TableOutcome> {
        match mapping.mode {
            SyncMode::Full => full_sync::run(&self.ctx, token, job, config, mapping).await,
            SyncMode::Incremental => {
                incremental_sync::run(&self.ctx, token, job, config, mapping).await
            }
        }
    }

    async fn validate(
        &self,
        token: &CancellationToken,
        config: &SyncConfig,
        mapping: &TableMapping,
        deep: bool,
    ) -> Result<()> {
        validate::run(&self.ctx, token, config, mapping, deep).await
    }
}
