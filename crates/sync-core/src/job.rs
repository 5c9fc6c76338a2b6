//! Sync job state and progress counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one [`SyncJob`].
///
/// `Pending → Running → {Completed | Failed | Cancelled}`. There is no
/// transition out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self → next` is an allowed transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => matches!(next, JobStatus::Running | JobStatus::Cancelled),
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Aggregated counters for one job run.
///
/// The percentage is derived, never stored authoritatively.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total_tables: u64,
    pub completed_tables: u64,
    pub total_rows: u64,
    pub processed_rows: u64,
}

impl Progress {
    /// Completion percentage over tables, 0.0 when nothing is known yet.
    pub fn percentage(&self) -> f64 {
        if self.total_tables == 0 {
            0.0
        } else {
            self.completed_tables as f64 / self.total_tables as f64 * 100.0
        }
    }
}

/// One execution of a `SyncConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub config_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl SyncJob {
    /// Fresh pending job for the given config.
    pub fn new(id: String, config_id: String) -> Self {
        Self {
            id,
            config_id,
            status: JobStatus::Pending,
            started_at: None,
            finished_at: None,
            progress: Progress::default(),
            last_error: None,
            created_at: Utc::now(),
        }
    }
}
