//! Progress reporting to the monitoring sink.
//!
//! The engine streams job and table progress to a [`ProgressSink`]. Sink
//! failures are never allowed to fail a sync, so the interface is
//! infallible; implementations log their own trouble and move on.

use async_trait::async_trait;
use std::sync::Arc;
use sync_core::{JobStatus, Progress};
use tracing::{error, info, warn};

/// Per-table status values reported to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for TableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TableStatus::Running => "running",
            TableStatus::Completed => "completed",
            TableStatus::Failed => "failed",
            TableStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Monitoring sink collaborator.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn start_job(&self, job_id: &str, total_tables: u64);
    async fn update_job_progress(&self, job_id: &str, progress: Progress);
    async fn update_table_progress(
        &self,
        job_id: &str,
        table: &str,
        status: TableStatus,
        processed: u64,
        total: u64,
        error: Option<&str>,
    );
    async fn finish_job(&self, job_id: &str, status: JobStatus, error: Option<&str>);
    async fn log_event(&self, job_id: &str, table: Option<&str>, level: &str, message: &str);
    async fn add_warning(&self, job_id: &str, message: &str);
}

/// Sink that mirrors everything into the process log.
pub struct LoggingProgressSink;

#[async_trait]
impl ProgressSink for LoggingProgressSink {
    async fn start_job(&self, job_id: &str, total_tables: u64) {
        info!(job_id, total_tables, "job started");
    }

    async fn update_job_progress(&self, job_id: &str, progress: Progress) {
        info!(
            job_id,
            completed = progress.completed_tables,
            total = progress.total_tables,
            rows = progress.processed_rows,
            "job progress {:.1}%",
            progress.percentage()
        );
    }

    async fn update_table_progress(
        &self,
        job_id: &str,
        table: &str,
        status: TableStatus,
        processed: u64,
        total: u64,
        error: Option<&str>,
    ) {
        match error {
            Some(err) => warn!(job_id, table, %status, processed, total, "table: {err}"),
            None => info!(job_id, table, %status, processed, total, "table progress"),
        }
    }

    async fn finish_job(&self, job_id: &str, status: JobStatus, error: Option<&str>) {
        match error {
            Some(err) => error!(job_id, %status, "job finished: {err}"),
            None => info!(job_id, %status, "job finished"),
        }
    }

    async fn log_event(&self, job_id: &str, table: Option<&str>, level: &str, message: &str) {
        let table = table.unwrap_or("-");
        match level {
            "error" => error!(job_id, table, "{message}"),
            "warn" => warn!(job_id, table, "{message}"),
            _ => info!(job_id, table, "{message}"),
        }
    }

    async fn add_warning(&self, job_id: &str, message: &str) {
        warn!(job_id, "{message}");
    }
}

/// Sink that drops everything.
pub struct NoopProgressSink;

#[async_trait]
impl ProgressSink for NoopProgressSink {
    async fn start_job(&self, _: &str, _: u64) {}
    async fn update_job_progress(&self, _: &str, _: Progress) {}
    async fn update_table_progress(
        &self,
        _: &str,
        _: &str,
        _: TableStatus,
        _: u64,
        _: u64,
        _: Option<&str>,
    ) {
    }
    async fn finish_job(&self, _: &str, _: JobStatus, _: Option<&str>) {}
    async fn log_event(&self, _: &str, _: Option<&str>, _: &str, _: &str) {}
    async fn add_warning(&self, _: &str, _: &str) {}
}

/// Fan-out to several sinks.
pub struct CompositeProgressSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl CompositeProgressSink {
    pub fn new(sinks: Vec<Arc<dyn ProgressSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl ProgressSink for CompositeProgressSink {
    async fn start_job(&self, job_id: &str, total_tables: u64) {
        for sink in &self.sinks {
            sink.start_job(job_id, total_tables).await;
        }
    }

    async fn update_job_progress(&self, job_id: &str, progress: Progress) {
        for sink in &self.sinks {
            sink.update_job_progress(job_id, progress).await;
        }
    }

    async fn update_table_progress(
        &self,
        job_id: &str,
        table: &str,
        status: TableStatus,
        processed: u64,
        total: u64,
        error: Option<&str>,
    ) {
        for sink in &self.sinks {
            sink.update_table_progress(job_id, table, status, processed, total, error)
                .await;
        }
    }

    async fn finish_job(&self, job_id: &str, status: JobStatus, error: Option<&str>) {
        for sink in &self.sinks {
            sink.finish_job(job_id, status, error).await;
        }
    }

    async fn log_event(&self, job_id: &str, table: Option<&str>, level: &str, message: &str) {
        for sink in &self.sinks {
            sink.log_event(job_id, table, level, message).await;
        }
    }

    async fn add_warning(&self, job_id: &str, message: &str) {
        for sink in &self.sinks {
            sink.add_warning(job_id, message).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every sink call for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn start_job(&self, job_id: &str, total_tables: u64) {
            self.push(format!("start {job_id} {total_tables}"));
        }

        async fn update_job_progress(&self, job_id: &str, progress: Progress) {
            self.push(format!(
                "progress {job_id} {}/{}",
                progress.completed_tables, progress.total_tables
            ));
        }

        async fn update_table_progress(
            &self,
            job_id: &str,
            table: &str,
            status: TableStatus,
            processed: u64,
            total: u64,
            error: Option<&str>,
        ) {
            let suffix = error.map(|e| format!(" err={e}")).unwrap_or_default();
            self.push(format!(
                "table {job_id} {table} {status} {processed}/{total}{suffix}"
            ));
        }

        async fn finish_job(&self, job_id: &str, status: JobStatus, error: Option<&str>) {
            let suffix = error.map(|e| format!(" err={e}")).unwrap_or_default();
            self.push(format!("finish {job_id} {status}{suffix}"));
        }

        async fn log_event(&self, job_id: &str, table: Option<&str>, level: &str, message: &str) {
            self.push(format!(
                "log {job_id} {} {level} {message}",
                table.unwrap_or("-")
            ));
        }

        async fn add_warning(&self, job_id: &str, message: &str) {
            self.push(format!("warn {job_id} {message}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    #[tokio::test]
    async fn test_composite_fans_out() {
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        let composite = CompositeProgressSink::new(vec![a.clone(), b.clone()]);

        composite.start_job("j1", 2).await;
        composite.add_warning("j1", "slow source").await;

        for sink in [&a, &b] {
            let events = sink.events();
            assert_eq!(events, vec!["start j1 2", "warn j1 slow source"]);
        }
    }
}
