//! Per-job execution state machine.
//!
//! One call to [`JobExecutor::run`] takes a pending job to a terminal
//! status: it resumes from the job checkpoint when one exists, walks the
//! enabled table mappings in config order, wraps each table sync in the
//! retrier, and resolves failures per the classified severity and the
//! config's conflict policy.

use std::sync::Arc;

use checkpoint::{CheckpointManager, JobCheckpoint};
use chrono::Utc;
use sync_core::{ConflictPolicy, JobStatus, SyncJob};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::classify::ClassifiedError;
use crate::progress::{ProgressSink, TableStatus};
use crate::retry::{retry, RetryError, RetryPolicy};
use crate::store::{ConfigStore, LogRecord};
use crate::sync::TableSyncer;

/// Reason string surfaced for user-driven cancellation.
pub const CANCELLED_BY_USER: &str = "Job cancelled by user";

pub struct JobExecutor {
    store: Arc<dyn ConfigStore>,
    checkpoints: CheckpointManager,
    sink: Arc<dyn ProgressSink>,
    syncer: Arc<dyn TableSyncer>,
    retry_policy: RetryPolicy,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        checkpoints: CheckpointManager,
        sink: Arc<dyn ProgressSink>,
        syncer: Arc<dyn TableSyncer>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            checkpoints,
            sink,
            syncer,
            retry_policy,
        }
    }

    /// Drive `job` to a terminal status and persist it.
    pub async fn run(&self, token: &CancellationToken, mut job: SyncJob) -> SyncJob {
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        if let Err(e) = self.store.put_job(job.clone()).await {
            error!(job_id = %job.id, "failed to persist running job: {e:#}");
        }

        match self.execute(token, &mut job).await {
            Outcome::Completed => self.finish(job, JobStatus::Completed, None).await,
            Outcome::Cancelled => {
                self.finish(job, JobStatus::Cancelled, Some(CANCELLED_BY_USER.to_string()))
                    .await
            }
            Outcome::Failed(message) => self.finish(job, JobStatus::Failed, Some(message)).await,
        }
    }

    async fn execute(&self, token: &CancellationToken, job: &mut SyncJob) -> Outcome {
        let config = match self.store.get_sync_config(&job.config_id).await {
            Ok(Some(config)) => config,
            Ok(None) => return Outcome::Failed(format!("unknown sync config {}", job.config_id)),
            Err(e) => return Outcome::Failed(format!("failed to load sync config: {e:#}")),
        };
        if !config.enabled {
            return Outcome::Failed(format!("sync config {} is disabled", config.id));
        }

        // Resume from a previous crashed or cancelled run when possible.
        let mut checkpoint = match self.checkpoints.load_job(&job.id).await {
            Ok(Some(existing)) => {
                info!(
                    job_id = %job.id,
                    completed = existing.completed_tables.len(),
                    "resuming job from checkpoint"
                );
                self.sink
                    .log_event(
                        &job.id,
                        None,
                        "info",
                        &format!(
                            "resumed from checkpoint with {} tables completed",
                            existing.completed_tables.len()
                        ),
                    )
                    .await;
                job.progress = existing.progress;
                existing
            }
            Ok(None) => JobCheckpoint::new(job.id.clone(), config.id.clone()),
            Err(e) => return Outcome::Failed(format!("failed to load job checkpoint: {e:#}")),
        };

        let mappings: Vec<_> = config.enabled_mappings().cloned().collect();
        job.progress.total_tables = mappings.len() as u64;
        checkpoint.progress = job.progress;
        self.sink.start_job(&job.id, job.progress.total_tables).await;

        let mut skipped: Vec<String> = Vec::new();

        for mapping in &mappings {
            if token.is_cancelled() {
                return Outcome::Cancelled;
            }
            if checkpoint.is_completed(&mapping.source_table) {
                continue;
            }

            checkpoint.current_table = Some(mapping.source_table.clone());
            checkpoint.updated_at = Utc::now();
            if let Err(e) = self.checkpoints.save_job(&checkpoint).await {
                return Outcome::Failed(format!("failed to persist job checkpoint: {e:#}"));
            }

            self.sink
                .update_table_progress(
                    &job.id,
                    &mapping.source_table,
                    TableStatus::Running,
                    0,
                    0,
                    None,
                )
                .await;

            let attempt = retry(&self.retry_policy, token, || {
                self.syncer.sync_table(token, job, &config, mapping)
            })
            .await;

            match attempt {
                Ok(outcome) if outcome.cancelled => return Outcome::Cancelled,
                Ok(outcome) => {
                    job.progress.completed_tables += 1;
                    job.progress.total_rows += outcome.rows_total;
                    job.progress.processed_rows += outcome.rows_processed;

                    checkpoint.mark_completed(&mapping.source_table);
                    checkpoint.progress = job.progress;
                    if let Err(e) = self.checkpoints.save_job(&checkpoint).await {
                        return Outcome::Failed(format!("failed to persist job checkpoint: {e:#}"));
                    }

                    self.sink
                        .update_table_progress(
                            &job.id,
                            &mapping.source_table,
                            TableStatus::Completed,
                            outcome.rows_processed,
                            outcome.rows_total,
                            None,
                        )
                        .await;
                    self.sink.update_job_progress(&job.id, job.progress).await;
                }
                Err(RetryError::Cancelled) => return Outcome::Cancelled,
                Err(RetryError::Failed(classified)) => {
                    let classified = classified.with_table(mapping.source_table.clone());
                    match self.handle_table_failure(job, &config.options.conflict_policy, &classified).await {
                        FailurePlan::AbortJob => return Outcome::Failed(classified.to_string()),
                        FailurePlan::SkipTable => {
                            skipped.push(mapping.source_table.clone());
                            continue;
                        }
                    }
                }
            }
        }

        if !skipped.is_empty() {
            job.last_error = Some(format!("{} tables skipped: {}", skipped.len(), skipped.join(", ")));
        }

        // Everything reachable ran; the checkpoint has served its purpose.
        if let Err(e) = self.checkpoints.delete_job(&job.id).await {
            warn!(job_id = %job.id, "failed to delete job checkpoint: {e:#}");
        }
        Outcome::Completed
    }

    async fn handle_table_failure(
        &self,
        job: &SyncJob,
        policy: &ConflictPolicy,
        classified: &ClassifiedError,
    ) -> FailurePlan {
        let message = classified.to_string();
        self.sink
            .update_table_progress(
                &job.id,
                classified.table.as_deref().unwrap_or("-"),
                TableStatus::Failed,
                0,
                0,
                Some(&message),
            )
            .await;
        self.sink
            .log_event(&job.id, classified.table.as_deref(), "error", &message)
            .await;
        if let Err(e) = self
            .store
            .append_log(LogRecord {
                job_id: job.id.clone(),
                table: classified.table.clone(),
                level: "error".to_string(),
                message: message.clone(),
                at: Utc::now(),
            })
            .await
        {
            warn!(job_id = %job.id, "failed to append log record: {e:#}");
        }

        if classified.is_critical() {
            error!(job_id = %job.id, "critical error, aborting job: {message}");
            return FailurePlan::AbortJob;
        }
        if matches!(policy, ConflictPolicy::Fail) {
            return FailurePlan::AbortJob;
        }

        self.sink
            .add_warning(
                &job.id,
                &format!(
                    "table {} skipped after error",
                    classified.table.as_deref().unwrap_or("-")
                ),
            )
            .await;
        FailurePlan::SkipTable
    }

    /// Apply the terminal transition, persist, and notify the sink.
    async fn finish(&self, mut job: SyncJob, status: JobStatus, message: Option<String>) -> SyncJob {
        debug_assert!(job.status.can_transition_to(status));
        job.status = status;
        job.finished_at = Some(Utc::now());
        if message.is_some() {
            job.last_error = message.clone();
        }

        if let Err(e) = self.store.put_job(job.clone()).await {
            error!(job_id = %job.id, "failed to persist terminal job: {e:#}");
        }
        self.sink
            .finish_job(&job.id, status, job.last_error.as_deref())
            .await;
        job
    }
}

enum Outcome {
    Completed,
    Cancelled,
    Failed(String),
}

enum FailurePlan {
    AbortJob,
    SkipTable,
}
