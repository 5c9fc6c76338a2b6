//! Checkpoint persistence contract.
//!
//! The engine does not talk to a database here; it hands records to whatever
//! store the host wires in (the config repository in production, an
//! in-memory map in tests).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of the shared checkpoint table.
///
/// Job checkpoints use `id = "job_" + job_id`; table checkpoints use the
/// mapping id. `payload` holds the JSON-serialized checkpoint; an empty
/// payload is a tombstone left behind by a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCheckpoint {
    pub id: String,
    /// Mapping reference for table checkpoints, empty for job checkpoints.
    #[serde(default)]
    pub mapping_ref: String,
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sync_value: Option<String>,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredCheckpoint {
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Persistence operations the checkpoint manager needs.
///
/// `upsert` replaces an existing record with the same id or inserts a new
/// one; implementations must preserve the original `created_at` on update.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<StoredCheckpoint>>;
    async fn upsert(&self, record: StoredCheckpoint) -> Result<()>;
}
