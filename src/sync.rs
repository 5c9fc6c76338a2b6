//! Table sync seam between the job executor and the database engine.
//!
//! The executor drives [`TableSyncer`] without knowing how tables move;
//! [`crate::mysql::MysqlTableSyncer`] is the production implementation and
//! tests substitute scripted fakes.

use anyhow::Result;
use async_trait::async_trait;
use sync_core::{SyncConfig, SyncJob, TableMapping};
use tokio_util::sync::CancellationToken;

/// Result of syncing one table mapping.
#[derive(Debug, Clone, Default)]
pub struct TableOutcome {
    /// Rows written to the target in this run.
    pub rows_processed: u64,
    /// Rows the source offered under the mapping's filter.
    pub rows_total: u64,
    /// The run stopped early because cancellation was observed.
    pub cancelled: bool,
}

/// One-table sync operations.
#[async_trait]
pub trait TableSyncer: Send + Sync {
    /// Run the mapping's configured sync mode end-to-end.
    async fn sync_table(
        &self,
        token: &CancellationToken,
        job: &SyncJob,
        config: &SyncConfig,
        mapping: &TableMapping,
    ) -> Result<TableOutcome>;

    /// Compare source and target row counts, and with `deep` also the
    /// per-row checksums.
    async fn validate(
        &self,
        token: &CancellationToken,
        config: &SyncConfig,
        mapping: &TableMapping,
        deep: bool,
    ) -> Result<()>;
}
