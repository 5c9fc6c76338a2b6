//! Persistence facade for configuration, jobs and checkpoints.
//!
//! The engine never talks to its own metadata database directly; it goes
//! through [`ConfigStore`]. Production deployments back this with the
//! repository service, while [`MemoryConfigStore`] serves tests and the
//! single-process CLI.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use checkpoint::{CheckpointStore, StoredCheckpoint};
use chrono::{DateTime, Utc};
use sync_core::{ConnectionDescriptor, JobStatus, SyncConfig, SyncJob, TableMapping};

/// One appended log line.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub job_id: String,
    pub table: Option<String>,
    pub level: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Data-access operations the engine depends on.
#[async_trait]
pub trait ConfigStore: CheckpointStore {
    async fn get_connection(&self, id: &str) -> Result<Option<ConnectionDescriptor>>;
    async fn put_connection(&self, descriptor: ConnectionDescriptor) -> Result<()>;
    async fn delete_connection(&self, id: &str) -> Result<()>;

    async fn get_sync_config(&self, id: &str) -> Result<Option<SyncConfig>>;
    async fn put_sync_config(&self, config: SyncConfig) -> Result<()>;
    async fn delete_sync_config(&self, id: &str) -> Result<()>;

    /// Replace one mapping inside its parent config.
    async fn update_mapping(&self, mapping: TableMapping) -> Result<()>;

    async fn get_job(&self, id: &str) -> Result<Option<SyncJob>>;
    async fn put_job(&self, job: SyncJob) -> Result<()>;
    async fn jobs_by_status(&self, status: JobStatus) -> Result<Vec<SyncJob>>;

    async fn append_log(&self, record: LogRecord) -> Result<()>;
}

/// In-memory store: `RwLock`'d maps, suitable for tests and one-shot CLI
/// runs where nothing must outlive the process.
#[derive(Default)]
pub struct MemoryConfigStore {
    connections: RwLock<HashMap<String, ConnectionDescriptor>>,
    configs: RwLock<HashMap<String, SyncConfig>>,
    jobs: RwLock<HashMap<String, SyncJob>>,
    checkpoints: RwLock<HashMap<String, StoredCheckpoint>>,
    logs: RwLock<Vec<LogRecord>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_count(&self) -> usize {
        self.logs.read().unwrap().len()
    }
}

#[async_trait]
impl CheckpointStore for MemoryConfigStore {
    async fn get(&self, id: &str) -> Result<Option<StoredCheckpoint>> {
        Ok(self.checkpoints.read().unwrap().get(id).cloned())
    }

    async fn upsert(&self, mut record: StoredCheckpoint) -> Result<()> {
        let mut checkpoints = self.checkpoints.write().unwrap();
        if let Some(existing) = checkpoints.get(&record.id) {
            record.created_at = existing.created_at;
        }
        checkpoints.insert(record.id.clone(), record);
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get_connection(&self, id: &str) -> Result<Option<ConnectionDescriptor>> {
        Ok(self.connections.read().unwrap().get(id).cloned())
    }

    async fn put_connection(&self, descriptor: ConnectionDescriptor) -> Result<()> {
        self.connections
            .write()
            .unwrap()
            .insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    async fn delete_connection(&self, id: &str) -> Result<()> {
        self.connections.write().unwrap().remove(id);
        Ok(())
    }

    async fn get_sync_config(&self, id: &str) -> Result<Option<SyncConfig>> {
        Ok(self.configs.read().unwrap().get(id).cloned())
    }

    async fn put_sync_config(&self, config: SyncConfig) -> Result<()> {
        self.configs
            .write()
            .unwrap()
            .insert(config.id.clone(), config);
        Ok(())
    }

    async fn delete_sync_config(&self, id: &str) -> Result<()> {
        self.configs.write().unwrap().remove(id);
        Ok(())
    }

    async fn update_mapping(&self, mapping: TableMapping) -> Result<()> {
        let mut configs = self.configs.write().unwrap();
        let Some(config) = configs.get_mut(&mapping.config_id) else {
            bail!("unknown sync config {}", mapping.config_id);
        };
        match config.mappings.iter_mut().find(|m| m.id == mapping.id) {
            Some(slot) => *slot = mapping,
            None => config.mappings.push(mapping),
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<SyncJob>> {
        Ok(self.jobs.read().unwrap().get(id).cloned())
    }

    async fn put_job(&self, job: SyncJob) -> Result<()> {
        self.jobs.write().unwrap().insert(job.id.clone(), job);
        Ok(())
    }

    async fn jobs_by_status(&self, status: JobStatus) -> Result<Vec<SyncJob>> {
        Ok(self
            .jobs
            .read()
            .unwrap()
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect())
    }

    async fn append_log(&self, record: LogRecord) -> Result<()> {
        self.logs.write().unwrap().push(record);
        Ok(())
    }
}
