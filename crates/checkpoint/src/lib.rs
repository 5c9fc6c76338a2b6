//! Checkpoint management for mysql-sync.
//!
//! Checkpoints make crashed or cancelled jobs resumable. Two levels exist:
//!
//! - [`JobCheckpoint`] - which tables of a job already completed, plus the
//!   job's aggregate progress counters
//! - [`TableCheckpoint`] - how far incremental sync advanced within one
//!   table mapping (last observed change-column value)
//!
//! Both serialize to JSON with named fields, so a checkpoint written by an
//! older build still loads after new optional fields are added.
//!
//! Persistence goes through the [`CheckpointStore`] trait. Job and table
//! checkpoints share one store table keyed by opaque id strings; job
//! checkpoint ids carry a `"job_"` prefix to namespace them from table
//! checkpoint ids (which use the mapping id directly).

mod manager;
mod store;

pub use manager::CheckpointManager;
pub use store::{CheckpointStore, StoredCheckpoint};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sync_core::Progress;

/// Resume point for one table mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCheckpoint {
    /// The `TableMapping` this checkpoint belongs to.
    pub mapping_id: String,
    /// Last processed change-column value, rendered as a string
    /// (ISO timestamp or decimal integer depending on the tracking column).
    #[serde(default)]
    pub last_value: Option<String>,
    #[serde(default)]
    pub processed_rows: u64,
    #[serde(default)]
    pub total_rows: u64,
    #[serde(default)]
    pub batch_number: u64,
    pub updated_at: DateTime<Utc>,
}

impl TableCheckpoint {
    pub fn new(mapping_id: String) -> Self {
        Self {
            mapping_id,
            last_value: None,
            processed_rows: 0,
            total_rows: 0,
            batch_number: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Resume point for one job.
///
/// `completed_tables` only ever grows within a job, and `current_table` is
/// never a member of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCheckpoint {
    pub job_id: String,
    pub config_id: String,
    #[serde(default)]
    pub completed_tables: Vec<String>,
    #[serde(default)]
    pub current_table: Option<String>,
    /// Sub-checkpoint of the table currently in flight, if any.
    #[serde(default)]
    pub table_checkpoint: Option<TableCheckpoint>,
    #[serde(default)]
    pub progress: Progress,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobCheckpoint {
    pub fn new(job_id: String, config_id: String) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            config_id,
            completed_tables: Vec::new(),
            current_table: None,
            table_checkpoint: None,
            progress: Progress::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self, table: &str) -> bool {
        self.completed_tables.iter().any(|t| t == table)
    }

    /// Append `table` to the completed set and clear it as current.
    pub fn mark_completed(&mut self, table: &str) {
        if !self.is_completed(table) {
            self.completed_tables.push(table.to_string());
        }
        if self.current_table.as_deref() == Some(table) {
            self.current_table = None;
            self.table_checkpoint = None;
        }
        self.updated_at = Utc::now();
    }

    /// Storage key for a job checkpoint.
    pub fn storage_id(job_id: &str) -> String {
        format!("job_{job_id}")
    }
}
