//! Manager for saving and restoring job and table checkpoints.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sync_core::Progress;

use crate::{CheckpointStore, JobCheckpoint, StoredCheckpoint, TableCheckpoint};

/// Storage-agnostic checkpoint operations.
///
/// The manager owns no in-memory state beyond its store handle: every call
/// reads or writes through the [`CheckpointStore`], so two processes sharing
/// a store observe the same checkpoints.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Persist a job checkpoint, inserting or replacing by id.
    pub async fn save_job(&self, checkpoint: &JobCheckpoint) -> Result<()> {
        let payload =
            serde_json::to_string(checkpoint).context("failed to serialize job checkpoint")?;

        let now = Utc::now();
        self.store
            .upsert(StoredCheckpoint {
                id: JobCheckpoint::storage_id(&checkpoint.job_id),
                mapping_ref: String::new(),
                last_sync_time: Some(now),
                last_sync_value: None,
                payload,
                created_at: checkpoint.created_at,
                updated_at: now,
            })
            .await?;

        tracing::debug!(
            job_id = %checkpoint.job_id,
            completed = checkpoint.completed_tables.len(),
            "saved job checkpoint"
        );
        Ok(())
    }

    /// Load a job checkpoint. Tombstones read as absent.
    pub async fn load_job(&self, job_id: &str) -> Result<Option<JobCheckpoint>> {
        let record = self.store.get(&JobCheckpoint::storage_id(job_id)).await?;
        match record {
            Some(r) if !r.is_tombstone() => {
                let checkpoint = serde_json::from_str(&r.payload)
                    .with_context(|| format!("corrupt job checkpoint for {job_id}"))?;
                Ok(Some(checkpoint))
            }
            _ => Ok(None),
        }
    }

    /// Delete a job checkpoint by overwriting it with an empty payload.
    ///
    /// The tombstone keeps the row around as an audit trail of the run.
    pub async fn delete_job(&self, job_id: &str) -> Result<()> {
        let id = JobCheckpoint::storage_id(job_id);
        let created_at = match self.store.get(&id).await? {
            Some(existing) => existing.created_at,
            None => return Ok(()),
        };

        self.store
            .upsert(StoredCheckpoint {
                id,
                mapping_ref: String::new(),
                last_sync_time: None,
                last_sync_value: None,
                payload: String::new(),
                created_at,
                updated_at: Utc::now(),
            })
            .await?;

        tracing::debug!(job_id, "deleted job checkpoint");
        Ok(())
    }

    /// Persist a table checkpoint keyed by its mapping id.
    pub async fn save_table(&self, checkpoint: &TableCheckpoint) -> Result<()> {
        let payload =
            serde_json::to_string(checkpoint).context("failed to serialize table checkpoint")?;

        self.store
            .upsert(StoredCheckpoint {
                id: checkpoint.mapping_id.clone(),
                mapping_ref: checkpoint.mapping_id.clone(),
                last_sync_time: Some(checkpoint.updated_at),
                last_sync_value: checkpoint.last_value.clone(),
                payload,
                created_at: checkpoint.updated_at,
                updated_at: checkpoint.updated_at,
            })
            .await?;
        Ok(())
    }

    pub async fn load_table(&self, mapping_id: &str) -> Result<Option<TableCheckpoint>> {
        let record = self.store.get(mapping_id).await?;
        match record {
            Some(r) if !r.is_tombstone() => {
                let checkpoint = serde_json::from_str(&r.payload)
                    .with_context(|| format!("corrupt table checkpoint for {mapping_id}"))?;
                Ok(Some(checkpoint))
            }
            _ => Ok(None),
        }
    }

    /// Whether a job left a checkpoint behind to resume from.
    pub async fn can_resume(&self, job_id: &str) -> Result<bool> {
        Ok(self.load_job(job_id).await?.is_some())
    }

    /// Record `table` as completed in the job checkpoint.
    pub async fn mark_table_completed(&self, job_id: &str, table: &str) -> Result<()> {
        let mut checkpoint = self
            .load_job(job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no job checkpoint for {job_id}"))?;
        checkpoint.mark_completed(table);
        self.save_job(&checkpoint).await
    }

    pub async fn is_table_completed(&self, job_id: &str, table: &str) -> Result<bool> {
        Ok(self
            .load_job(job_id)
            .await?
            .map(|c| c.is_completed(table))
            .unwrap_or(false))
    }

    /// Refresh only the progress snapshot of an existing job checkpoint.
    pub async fn update_progress(&self, job_id: &str, progress: Progress) -> Result<()> {
        if let Some(mut checkpoint) = self.load_job(job_id).await? {
            checkpoint.progress = progress;
            checkpoint.updated_at = Utc::now();
            self.save_job(&checkpoint).await?;
        }
        Ok(())
    }
}
