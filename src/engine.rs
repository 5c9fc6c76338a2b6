//! Job engine: bounded queue, dispatcher, long-lived worker pool.
//!
//! Submitters enqueue pending jobs; the dispatcher hands each to an idle
//! worker; every worker drives the [`JobExecutor`] under a cancellation
//! token derived from the engine root. The bounded queue is the
//! backpressure signal to submitters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sync_core::{JobStatus, SyncJob};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::executor::{JobExecutor, CANCELLED_BY_USER};
use crate::store::ConfigStore;

/// Pool sizing.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            queue_capacity: 100,
        }
    }
}

/// State of one running job: the handle cancel() uses.
struct JobExecution {
    token: CancellationToken,
}

struct WorkerHandle {
    busy: Arc<AtomicBool>,
    tx: mpsc::Sender<SyncJob>,
}

struct Inner {
    store: Arc<dyn ConfigStore>,
    executor: Arc<JobExecutor>,
    root: CancellationToken,
    queue_tx: mpsc::Sender<SyncJob>,
    queue_len: AtomicUsize,
    active: RwLock<HashMap<String, JobExecution>>,
    running: AtomicBool,
    workers: Vec<WorkerHandle>,
}

impl Inner {
    fn idle_worker(&self) -> Option<&WorkerHandle> {
        self.workers.iter().find(|w| !w.busy.load(Ordering::SeqCst))
    }
}

/// The worker pool. One instance per process.
pub struct JobEngine {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobEngine {
    /// Spawn the workers and the dispatcher.
    pub fn start(
        store: Arc<dyn ConfigStore>,
        executor: Arc<JobExecutor>,
        config: EngineConfig,
    ) -> Self {
        let root = CancellationToken::new();
        let (queue_tx, queue_rx) = mpsc::channel::<SyncJob>(config.queue_capacity.max(1));

        let mut workers = Vec::with_capacity(config.workers);
        let mut worker_rxs = Vec::with_capacity(config.workers);
        for _ in 0..config.workers.max(1) {
            let (tx, rx) = mpsc::channel::<SyncJob>(1);
            workers.push(WorkerHandle {
                busy: Arc::new(AtomicBool::new(false)),
                tx,
            });
            worker_rxs.push(rx);
        }

        let inner = Arc::new(Inner {
            store,
            executor,
            root,
            queue_tx,
            queue_len: AtomicUsize::new(0),
            active: RwLock::new(HashMap::new()),
            running: AtomicBool::new(true),
            workers,
        });

        let mut tasks = Vec::new();
        for (index, rx) in worker_rxs.into_iter().enumerate() {
            tasks.push(tokio::spawn(worker_loop(inner.clone(), index, rx)));
        }
        tasks.push(tokio::spawn(dispatcher_loop(inner.clone(), queue_rx)));

        info!(
            workers = inner.workers.len(),
            queue = config.queue_capacity,
            "job engine started"
        );
        Self {
            inner,
            tasks: Mutex::new(tasks),
        }
    }

    /// Validate, persist and enqueue a job. Returns the job id.
    pub async fn submit(&self, mut job: SyncJob) -> Result<String> {
        if !self.is_running() {
            bail!("job engine is not running");
        }
        if job.id.is_empty() {
            job.id = Uuid::new_v4().to_string();
        }

        let config = self
            .inner
            .store
            .get_sync_config(&job.config_id)
            .await?
            .with_context(|| format!("unknown sync config {}", job.config_id))?;
        config.validate()?;

        job.status = JobStatus::Pending;
        let id = job.id.clone();
        self.inner.store.put_job(job.clone()).await?;

        match self.inner.queue_tx.try_send(job) {
            Ok(()) => {
                self.inner.queue_len.fetch_add(1, Ordering::SeqCst);
                debug!(job_id = %id, "job enqueued");
                Ok(id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => bail!("job queue is full"),
            Err(mpsc::error::TrySendError::Closed(_)) => bail!("job engine is shutting down"),
        }
    }

    /// Cancel a running or still-queued job.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        {
            let active = self.inner.active.read().unwrap();
            if let Some(execution) = active.get(job_id) {
                info!(job_id, "cancelling active job");
                execution.token.cancel();
                return Ok(());
            }
        }

        let Some(mut job) = self.inner.store.get_job(job_id).await? else {
            bail!("unknown job {job_id}");
        };
        match job.status {
            JobStatus::Pending => {
                // Still queued: mark terminal now, the dispatcher skips it
                // when it reaches the worker.
                job.status = JobStatus::Cancelled;
                job.finished_at = Some(Utc::now());
                job.last_error = Some(CANCELLED_BY_USER.to_string());
                self.inner.store.put_job(job).await?;
                Ok(())
            }
            status if status.is_terminal() => {
                bail!("job {job_id} is already {status}")
            }
            _ => bail!("job {job_id} is running but not owned by this engine"),
        }
    }

    /// Signal everything, wait for workers to finish, then return.
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("job engine shutting down");
        self.inner.root.cancel();

        let tasks = {
            let mut guard = self.tasks.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!("engine task panicked during shutdown: {e}");
            }
        }
        info!("job engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) && !self.inner.root.is_cancelled()
    }

    pub fn active_jobs(&self) -> usize {
        self.inner.active.read().unwrap().len()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue_len.load(Ordering::SeqCst)
    }
}

async fn dispatcher_loop(inner: Arc<Inner>, mut queue_rx: mpsc::Receiver<SyncJob>) {
    loop {
        let job = tokio::select! {
            _ = inner.root.cancelled() => return,
            job = queue_rx.recv() => match job {
                Some(job) => job,
                None => return,
            },
        };
        inner.queue_len.fetch_sub(1, Ordering::SeqCst);

        // Hand off to an idle worker, waiting briefly when all are busy.
        let mut pending = Some(job);
        while let Some(job) = pending.take() {
            if inner.root.is_cancelled() {
                return;
            }
            match inner.idle_worker() {
                Some(worker) => {
                    worker.busy.store(true, Ordering::SeqCst);
                    if let Err(send_error) = worker.tx.send(job).await {
                        // Worker gone; put the job back and try another.
                        warn!("worker channel closed during dispatch");
                        pending = Some(send_error.0);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
                None => {
                    pending = Some(job);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn worker_loop(inner: Arc<Inner>, index: usize, mut rx: mpsc::Receiver<SyncJob>) {
    let busy = inner.workers[index].busy.clone();
    loop {
        let job = tokio::select! {
            _ = inner.root.cancelled() => return,
            job = rx.recv() => match job {
                Some(job) => job,
                None => return,
            },
        };

        process_job(&inner, index, job).await;
        busy.store(false, Ordering::SeqCst);
    }
}

async fn process_job(inner: &Inner, index: usize, job: SyncJob) {
    // The job may have been cancelled while it sat in the queue.
    match inner.store.get_job(&job.id).await {
        Ok(Some(current)) if current.status.is_terminal() => {
            debug!(job_id = %job.id, status = %current.status, "skipping terminal queued job");
            return;
        }
        Err(e) => {
            error!(job_id = %job.id, "failed to re-read queued job: {e:#}");
        }
        _ => {}
    }

    let token = inner.root.child_token();
    inner.active.write().unwrap().insert(
        job.id.clone(),
        JobExecution {
            token: token.clone(),
        },
    );
    debug!(worker = index, job_id = %job.id, "worker picked up job");

    let finished = inner.executor.run(&token, job).await;

    inner.active.write().unwrap().remove(&finished.id);
    debug!(
        worker = index,
        job_id = %finished.id,
        status = %finished.status,
        "worker finished job"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use checkpoint::CheckpointManager;
    use std::sync::Mutex as StdMutex;
    use sync_core::{ConflictPolicy, SyncConfig, SyncMode, SyncOptions, TableMapping};
    use tokio::sync::Semaphore;

    use crate::progress::NoopProgressSink;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryConfigStore;
    use crate::sync::{TableOutcome, TableSyncer};

    /// Syncer that blocks each table on a gate permit, or returns a
    /// cancelled outcome when the token fires first.
    struct GateSyncer {
        gate: Semaphore,
        jobs_seen: StdMutex<Vec<String>>,
    }

    impl GateSyncer {
        fn new() -> Self {
            Self {
                gate: Semaphore::new(0),
                jobs_seen: StdMutex::new(Vec::new()),
            }
        }

        fn open(&self, permits: usize) {
            self.gate.add_permits(permits);
        }

        fn jobs_seen(&self) -> Vec<String> {
            self.jobs_seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TableSyncer for GateSyncer {
        async fn sync_table(
            &self,
            token: &CancellationToken,
            job: &SyncJob,
            _config: &SyncConfig,
            _mapping: &TableMapping,
        ) -> anyhow::Result<TableOutcome> {
            self.jobs_seen.lock().unwrap().push(job.id.clone());
            tokio::select! {
                _ = token.cancelled() => Ok(TableOutcome {
                    rows_processed: 0,
                    rows_total: 0,
                    cancelled: true,
                }),
                permit = self.gate.acquire() => {
                    permit.unwrap().forget();
                    Ok(TableOutcome {
                        rows_processed: 1,
                        rows_total: 1,
                        cancelled: false,
                    })
                }
            }
        }

        async fn validate(
            &self,
            _token: &CancellationToken,
            _config: &SyncConfig,
            _mapping: &TableMapping,
            _deep: bool,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            id: "cfg-1".to_string(),
            name: "test".to_string(),
            source_connection_id: "src".to_string(),
            target_connection_id: "dst".to_string(),
            source_database: "appdb".to_string(),
            target_database: String::new(),
            mappings: vec![TableMapping {
                id: "map-1".to_string(),
                config_id: "cfg-1".to_string(),
                source_table: "t1".to_string(),
                target_table: "t1".to_string(),
                mode: SyncMode::Full,
                enabled: true,
                filter: None,
            }],
            default_mode: SyncMode::Full,
            schedule: None,
            enabled: true,
            options: SyncOptions {
                conflict_policy: ConflictPolicy::Overwrite,
                ..SyncOptions::default()
            },
        }
    }

    struct Rig {
        store: Arc<MemoryConfigStore>,
        syncer: Arc<GateSyncer>,
        engine: JobEngine,
    }

    async fn rig(engine_config: EngineConfig) -> Rig {
        let store = Arc::new(MemoryConfigStore::new());
        store.put_sync_config(test_config()).await.unwrap();

        let syncer = Arc::new(GateSyncer::new());
        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            CheckpointManager::new(store.clone()),
            Arc::new(NoopProgressSink),
            syncer.clone(),
            RetryPolicy::default(),
        ));
        let engine = JobEngine::start(store.clone(), executor, engine_config);
        Rig {
            store,
            syncer,
            engine,
        }
    }

    fn job(id: &str) -> SyncJob {
        SyncJob::new(id.to_string(), "cfg-1".to_string())
    }

    async fn wait_for<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn wait_for_status(store: &MemoryConfigStore, id: &str, status: JobStatus) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(job) = store.get_job(id).await.unwrap() {
                    if job.status == status {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job {id} never reached {status}"));
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let rig = rig(EngineConfig::default()).await;
        rig.syncer.open(1);

        let id = rig.engine.submit(job("")).await.unwrap();
        assert!(!id.is_empty());

        wait_for_status(&rig.store, &id, JobStatus::Completed).await;
        wait_for(|| rig.engine.active_jobs() == 0).await;
        rig.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_unknown_config_is_rejected() {
        let rig = rig(EngineConfig::default()).await;
        let mut bad = job("j-bad");
        bad.config_id = "nope".to_string();

        let err = rig.engine.submit(bad).await.unwrap_err();
        assert!(err.to_string().contains("unknown sync config"));
        rig.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_active_job() {
        let rig = rig(EngineConfig::default()).await;

        let id = rig.engine.submit(job("j1")).await.unwrap();
        wait_for(|| rig.engine.active_jobs() == 1).await;

        rig.engine.cancel(&id).await.unwrap();
        wait_for_status(&rig.store, &id, JobStatus::Cancelled).await;

        let stored = rig.store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(stored.last_error.as_deref(), Some(CANCELLED_BY_USER));
        rig.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_queued_job_skips_execution() {
        let rig = rig(EngineConfig {
            workers: 1,
            queue_capacity: 10,
        })
        .await;

        // j1 occupies the only worker; j2 sits behind it.
        let j1 = rig.engine.submit(job("j1")).await.unwrap();
        wait_for(|| rig.engine.active_jobs() == 1).await;
        let j2 = rig.engine.submit(job("j2")).await.unwrap();

        rig.engine.cancel(&j2).await.unwrap();
        rig.syncer.open(2);

        wait_for_status(&rig.store, &j1, JobStatus::Completed).await;
        wait_for_status(&rig.store, &j2, JobStatus::Cancelled).await;
        assert!(!rig.syncer.jobs_seen().contains(&j2));
        rig.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_terminal_job_errors() {
        let rig = rig(EngineConfig::default()).await;
        rig.syncer.open(1);

        let id = rig.engine.submit(job("j1")).await.unwrap();
        wait_for_status(&rig.store, &id, JobStatus::Completed).await;

        let err = rig.engine.cancel(&id).await.unwrap_err();
        assert!(err.to_string().contains("already completed"));
        rig.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_full_rejects_submit() {
        let rig = rig(EngineConfig {
            workers: 1,
            queue_capacity: 1,
        })
        .await;

        // Worker busy with j1, dispatcher parked holding j2, j3 fills the
        // queue; j4 must bounce.
        rig.engine.submit(job("j1")).await.unwrap();
        wait_for(|| rig.engine.active_jobs() == 1).await;
        rig.engine.submit(job("j2")).await.unwrap();
        wait_for(|| rig.engine.queue_len() == 0).await;
        rig.engine.submit(job("j3")).await.unwrap();

        let err = rig.engine.submit(job("j4")).await.unwrap_err();
        assert!(err.to_string().contains("queue is full"));

        rig.syncer.open(10);
        rig.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_parallel_workers_run_jobs_concurrently() {
        let rig = rig(EngineConfig {
            workers: 2,
            queue_capacity: 10,
        })
        .await;

        let j1 = rig.engine.submit(job("j1")).await.unwrap();
        let j2 = rig.engine.submit(job("j2")).await.unwrap();
        wait_for(|| rig.engine.active_jobs() == 2).await;

        rig.syncer.open(2);
        wait_for_status(&rig.store, &j1, JobStatus::Completed).await;
        wait_for_status(&rig.store, &j2, JobStatus::Completed).await;
        rig.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let rig = rig(EngineConfig::default()).await;
        rig.engine.shutdown().await;

        let err = rig.engine.submit(job("j1")).await.unwrap_err();
        assert!(err.to_string().contains("not running"));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_active_jobs() {
        let rig = rig(EngineConfig::default()).await;

        let id = rig.engine.submit(job("j1")).await.unwrap();
        wait_for(|| rig.engine.active_jobs() == 1).await;

        rig.engine.shutdown().await;

        let stored = rig.store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(rig.engine.active_jobs(), 0);
    }
}
