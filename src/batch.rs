//! Batched row transfer.
//!
//! Moves rows from a source cursor into the target table in bounded-memory
//! batches. Batch size adapts to table size and available memory, every
//! batch insert runs under its own timeout, and a failed batch is recorded
//! rather than aborting the transfer.
//!
//! The processor is written against the [`RowFeed`] and [`BatchSink`]
//! traits so the transfer loop can be exercised without a server; the
//! driver-backed implementations live in [`crate::mysql`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use mysql_async::Value;
use sync_core::ident::{quote_ident, quote_qualified};
use sync_core::ConflictPolicy;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::optimize::{Compressor, RateLimiter};

/// Per-batch insert timeout.
pub const BATCH_TIMEOUT: Duration = Duration::from_secs(30);

const MB: u64 = 1024 * 1024;

/// Pick the working batch size for a table.
///
/// Starts from the configured size and caps it by table row count and by
/// the memory headroom left under the budget; the smaller cap wins. Never
/// returns zero.
pub fn adaptive_batch_size(configured: usize, total_rows: u64, available_memory: u64) -> usize {
    let row_cap = if total_rows > 10_000_000 {
        500
    } else if total_rows > 1_000_000 {
        1000
    } else if total_rows > 100_000 {
        2000
    } else {
        usize::MAX
    };

    let memory_cap = if available_memory < 100 * MB {
        200
    } else if available_memory < 256 * MB {
        500
    } else {
        usize::MAX
    };

    configured.max(1).min(row_cap).min(memory_cap)
}

/// Tracks the transfer buffers' in-flight byte estimate against a budget.
///
/// The batch processor registers each buffer while it is alive; when usage
/// crosses 80% of the budget the processor pauses before fetching more. A
/// "reclaim" in Rust is simply letting the finished buffers drop, so the
/// monitor only yields and re-checks, rate-limited to one forced pass per
/// five seconds.
pub struct MemoryMonitor {
    budget: u64,
    used: AtomicU64,
    last_reclaim: Mutex<Option<Instant>>,
}

impl MemoryMonitor {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            used: AtomicU64::new(0),
            last_reclaim: Mutex::new(None),
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> u64 {
        self.budget.saturating_sub(self.used())
    }

    fn threshold(&self) -> u64 {
        self.budget / 5 * 4
    }

    pub fn is_pressed(&self) -> bool {
        self.used() > self.threshold()
    }

    pub fn reserve(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn release(&self, bytes: u64) {
        self.used.fetch_sub(bytes.min(self.used()), Ordering::Relaxed);
    }

    /// Pause while usage is above the threshold, re-checking once a second.
    pub async fn wait_if_pressed(&self, token: &CancellationToken) {
        while self.is_pressed() && !token.is_cancelled() {
            let due = {
                let mut last = self.last_reclaim.lock().unwrap();
                match *last {
                    Some(at) if at.elapsed() <= Duration::from_secs(5) => false,
                    _ => {
                        *last = Some(Instant::now());
                        true
                    }
                }
            };
            if due {
                // Give finished buffers a chance to drop before re-checking.
                tokio::task::yield_now().await;
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }
}

/// Source cursor abstraction: rows already decoded to driver values.
#[async_trait]
pub trait RowFeed: Send {
    async fn next_row(&mut self) -> Result<Option<Vec<Value>>>;
}

/// Target write abstraction: one multi-row statement per call.
#[async_trait]
pub trait BatchSink: Send {
    async fn write_batch(&mut self, statement: &str, params: Vec<Value>) -> Result<u64>;
}

/// Conflict handling for the generated statement.
#[derive(Debug, Clone, Copy)]
pub enum InsertMode<'a> {
    /// Plain INSERT; the target table is fresh.
    Plain,
    /// INSERT with an ON DUPLICATE KEY clause derived from the policy.
    Upsert {
        policy: ConflictPolicy,
        primary_key: &'a [String],
    },
}

/// Build the multi-row statement for one batch.
///
/// Column order matches the source cursor's column order exactly; all
/// identifiers are backtick-quoted and every value is a positional param.
pub fn build_statement(
    database: &str,
    table: &str,
    columns: &[String],
    row_count: usize,
    mode: InsertMode<'_>,
) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let row_placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
    let values = vec![row_placeholders; row_count].join(", ");

    let mut statement = format!(
        "INSERT INTO {} ({column_list}) VALUES {values}",
        quote_qualified(database, table)
    );

    if let InsertMode::Upsert {
        policy,
        primary_key,
    } = mode
    {
        match policy {
            ConflictPolicy::Overwrite => {
                let assignments: Vec<String> = columns
                    .iter()
                    .filter(|c| !primary_key.contains(c))
                    .map(|c| format!("{0} = VALUES({0})", quote_ident(c)))
                    .collect();
                if assignments.is_empty() {
                    // Every column is part of the key; nothing to overwrite.
                    let pk = quote_ident(&primary_key[0]);
                    statement.push_str(&format!(" ON DUPLICATE KEY UPDATE {pk} = {pk}"));
                } else {
                    statement.push_str(&format!(
                        " ON DUPLICATE KEY UPDATE {}",
                        assignments.join(", ")
                    ));
                }
            }
            ConflictPolicy::Skip => {
                let pk = quote_ident(
                    primary_key
                        .first()
                        .map(String::as_str)
                        .unwrap_or_else(|| columns[0].as_str()),
                );
                statement.push_str(&format!(" ON DUPLICATE KEY UPDATE {pk} = {pk}"));
            }
            // The database raises the collision; classification surfaces it
            // as a primary-key-conflict.
            ConflictPolicy::Fail => {}
        }
    }

    statement
}

/// Rough wire size of one value, for pacing and the memory monitor.
pub fn estimate_value_bytes(value: &Value) -> u64 {
    match value {
        Value::NULL => 4,
        Value::Bytes(b) => b.len() as u64,
        Value::Int(_) | Value::UInt(_) | Value::Double(_) => 8,
        Value::Float(_) => 4,
        Value::Date(..) => 12,
        Value::Time(..) => 12,
    }
}

fn estimate_row_bytes(row: &[Value]) -> u64 {
    row.iter().map(estimate_value_bytes).sum()
}

/// Counters for one table transfer.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub total_rows: u64,
    pub processed_rows: u64,
    pub failed_rows: u64,
    pub batches: u64,
    pub elapsed: Duration,
    pub avg_batch: Duration,
    pub memory_peak: u64,
    pub rows_per_sec: f64,
    /// Cancellation was observed; the transfer stopped at a batch boundary.
    pub cancelled: bool,
}

/// Batched transfer driver.
pub struct BatchProcessor<'a> {
    pub batch_size: usize,
    pub timeout: Duration,
    pub limiter: &'a RateLimiter,
    pub memory: &'a MemoryMonitor,
    /// Used to size rate-limiter acquisitions when the config compresses
    /// batch payloads on the wire.
    pub compressor: Option<&'a Compressor>,
    pub dry_run: bool,
}

impl<'a> BatchProcessor<'a> {
    /// Stream rows from `feed` into `sink` until the feed ends or the token
    /// cancels. `on_batch` is invoked after every batch with (processed,
    /// failed) running totals.
    pub async fn run<F>(
        &self,
        token: &CancellationToken,
        feed: &mut dyn RowFeed,
        sink: &mut dyn BatchSink,
        database: &str,
        table: &str,
        columns: &[String],
        mode: InsertMode<'_>,
        mut on_batch: F,
    ) -> Result<BatchReport>
    where
        F: FnMut(u64, u64),
    {
        let started = Instant::now();
        let mut report = BatchReport::default();
        let mut batch_durations = Duration::ZERO;
        let mut exhausted = false;

        while !exhausted {
            self.memory.wait_if_pressed(token).await;
            if token.is_cancelled() {
                report.cancelled = true;
                break;
            }

            // Fill one batch buffer.
            let mut buffer: Vec<Vec<Value>> = Vec::with_capacity(self.batch_size);
            while buffer.len() < self.batch_size {
                match feed.next_row().await? {
                    Some(row) => buffer.push(row),
                    None => {
                        exhausted = true;
                        break;
                    }
                }
            }
            if buffer.is_empty() {
                break;
            }

            let rows = buffer.len() as u64;
            let raw_bytes: u64 = buffer.iter().map(|r| estimate_row_bytes(r)).sum();
            report.total_rows += rows;
            report.memory_peak = report.memory_peak.max(self.memory.used() + raw_bytes);

            let wire_bytes = match self.compressor {
                Some(compressor) => {
                    let mut payload = Vec::with_capacity(raw_bytes as usize);
                    for row in &buffer {
                        for value in row {
                            payload.extend_from_slice(value.as_sql(true).as_bytes());
                        }
                    }
                    compressor.compress(&payload)?.len() as u64
                }
                None => raw_bytes,
            };
            if !self.limiter.acquire(token, wire_bytes).await {
                report.cancelled = true;
                break;
            }

            let statement = build_statement(database, table, columns, buffer.len(), mode);
            let params: Vec<Value> = buffer.into_iter().flatten().collect();

            self.memory.reserve(raw_bytes);
            let batch_started = Instant::now();
            let outcome = if self.dry_run {
                debug!(table, rows, "dry-run: skipping batch insert");
                Ok(rows)
            } else {
                match tokio::time::timeout(self.timeout, sink.write_batch(&statement, params))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!(
                        "batch insert timeout after {:?} on {table}",
                        self.timeout
                    )),
                }
            };
            self.memory.release(raw_bytes);
            batch_durations += batch_started.elapsed();
            report.batches += 1;

            match outcome {
                Ok(_) => report.processed_rows += rows,
                Err(e) => {
                    // A failed batch does not abort the transfer.
                    warn!(table, rows, "batch insert failed: {e:#}");
                    report.failed_rows += rows;
                }
            }

            on_batch(report.processed_rows, report.failed_rows);
        }

        report.elapsed = started.elapsed();
        if report.batches > 0 {
            report.avg_batch = batch_durations / report.batches as u32;
        }
        if !report.elapsed.is_zero() {
            report.rows_per_sec = report.processed_rows as f64 / report.elapsed.as_secs_f64();
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecFeed {
        rows: std::vec::IntoIter<Vec<Value>>,
    }

    impl VecFeed {
        fn new(rows: Vec<Vec<Value>>) -> Self {
            Self {
                rows: rows.into_iter(),
            }
        }
    }

    #[async_trait]
    impl RowFeed for VecFeed {
        async fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
            Ok(self.rows.next())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        statements: Vec<String>,
        param_counts: Vec<usize>,
        fail_batches: Vec<u64>,
        seen: u64,
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn write_batch(&mut self, statement: &str, params: Vec<Value>) -> Result<u64> {
            self.seen += 1;
            if self.fail_batches.contains(&self.seen) {
                anyhow::bail!("Lock wait timeout exceeded");
            }
            self.statements.push(statement.to_string());
            self.param_counts.push(params.len());
            Ok((params.len() / 2) as u64)
        }
    }

    fn row(id: i64, name: &str) -> Vec<Value> {
        vec![Value::Int(id), Value::Bytes(name.as_bytes().to_vec())]
    }

    fn columns() -> Vec<String> {
        vec!["id".to_string(), "name".to_string()]
    }

    fn processor<'a>(
        limiter: &'a RateLimiter,
        memory: &'a MemoryMonitor,
        batch_size: usize,
    ) -> BatchProcessor<'a> {
        BatchProcessor {
            batch_size,
            timeout: BATCH_TIMEOUT,
            limiter,
            memory,
            compressor: None,
            dry_run: false,
        }
    }

    #[test]
    fn test_adaptive_batch_size_row_caps() {
        assert_eq!(adaptive_batch_size(5000, 20_000_000, u64::MAX), 500);
        assert_eq!(adaptive_batch_size(5000, 2_000_000, u64::MAX), 1000);
        assert_eq!(adaptive_batch_size(5000, 200_000, u64::MAX), 2000);
        assert_eq!(adaptive_batch_size(5000, 50_000, u64::MAX), 5000);
    }

    #[test]
    fn test_adaptive_batch_size_memory_caps() {
        assert_eq!(adaptive_batch_size(1000, 0, 50 * MB), 200);
        assert_eq!(adaptive_batch_size(1000, 0, 200 * MB), 500);
        assert_eq!(adaptive_batch_size(1000, 0, 512 * MB), 1000);
    }

    #[test]
    fn test_adaptive_batch_size_smaller_cap_wins() {
        // Row cap says 1000, memory cap says 200.
        assert_eq!(adaptive_batch_size(5000, 2_000_000, 50 * MB), 200);
        // Configured size below every cap is kept.
        assert_eq!(adaptive_batch_size(1, 20_000_000, 50 * MB), 1);
        assert_eq!(adaptive_batch_size(0, 0, u64::MAX), 1);
    }

    #[test]
    fn test_build_plain_insert() {
        let stmt = build_statement("appdb", "users", &columns(), 2, InsertMode::Plain);
        assert_eq!(
            stmt,
            "INSERT INTO `appdb`.`users` (`id`, `name`) VALUES (?, ?), (?, ?)"
        );
    }

    #[test]
    fn test_build_upsert_overwrite() {
        let pk = vec!["id".to_string()];
        let stmt = build_statement(
            "appdb",
            "users",
            &columns(),
            1,
            InsertMode::Upsert {
                policy: ConflictPolicy::Overwrite,
                primary_key: &pk,
            },
        );
        assert_eq!(
            stmt,
            "INSERT INTO `appdb`.`users` (`id`, `name`) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE `name` = VALUES(`name`)"
        );
    }

    #[test]
    fn test_build_upsert_skip_is_noop_assignment() {
        let pk = vec!["id".to_string()];
        let stmt = build_statement(
            "appdb",
            "users",
            &columns(),
            1,
            InsertMode::Upsert {
                policy: ConflictPolicy::Skip,
                primary_key: &pk,
            },
        );
        assert!(stmt.ends_with("ON DUPLICATE KEY UPDATE `id` = `id`"));
    }

    #[test]
    fn test_build_upsert_fail_has_no_conflict_clause() {
        let pk = vec!["id".to_string()];
        let stmt = build_statement(
            "appdb",
            "users",
            &columns(),
            1,
            InsertMode::Upsert {
                policy: ConflictPolicy::Fail,
                primary_key: &pk,
            },
        );
        assert!(!stmt.contains("ON DUPLICATE KEY"));
    }

    #[test]
    fn test_build_upsert_overwrite_all_columns_keyed() {
        let pk = columns();
        let stmt = build_statement(
            "appdb",
            "users",
            &columns(),
            1,
            InsertMode::Upsert {
                policy: ConflictPolicy::Overwrite,
                primary_key: &pk,
            },
        );
        assert!(stmt.ends_with("ON DUPLICATE KEY UPDATE `id` = `id`"));
    }

    #[tokio::test]
    async fn test_transfer_batches_and_counts() {
        let limiter = RateLimiter::disabled();
        let memory = MemoryMonitor::new(1024 * MB);
        let token = CancellationToken::new();
        let mut feed = VecFeed::new((0..5).map(|i| row(i, "x")).collect());
        let mut sink = RecordingSink::default();

        let report = processor(&limiter, &memory, 2)
            .run(
                &token,
                &mut feed,
                &mut sink,
                "appdb",
                "users",
                &columns(),
                InsertMode::Plain,
                |_, _| {},
            )
            .await
            .unwrap();

        // 5 rows at batch size 2: 2 + 2 + 1.
        assert_eq!(report.batches, 3);
        assert_eq!(report.total_rows, 5);
        assert_eq!(report.processed_rows, 5);
        assert_eq!(report.failed_rows, 0);
        assert!(!report.cancelled);
        assert_eq!(sink.param_counts, vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn test_empty_feed_is_zero_batches() {
        let limiter = RateLimiter::disabled();
        let memory = MemoryMonitor::new(1024 * MB);
        let token = CancellationToken::new();
        let mut feed = VecFeed::new(Vec::new());
        let mut sink = RecordingSink::default();

        let report = processor(&limiter, &memory, 1000)
            .run(
                &token,
                &mut feed,
                &mut sink,
                "appdb",
                "users",
                &columns(),
                InsertMode::Plain,
                |_, _| {},
            )
            .await
            .unwrap();

        assert_eq!(report.batches, 0);
        assert_eq!(report.processed_rows, 0);
    }

    #[tokio::test]
    async fn test_single_row_single_batch() {
        let limiter = RateLimiter::disabled();
        let memory = MemoryMonitor::new(1024 * MB);
        let token = CancellationToken::new();
        let mut feed = VecFeed::new(vec![row(1, "a")]);
        let mut sink = RecordingSink::default();

        let report = processor(&limiter, &memory, 1000)
            .run(
                &token,
                &mut feed,
                &mut sink,
                "appdb",
                "users",
                &columns(),
                InsertMode::Plain,
                |_, _| {},
            )
            .await
            .unwrap();

        assert_eq!(report.batches, 1);
        assert_eq!(report.processed_rows, 1);
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_abort() {
        let limiter = RateLimiter::disabled();
        let memory = MemoryMonitor::new(1024 * MB);
        let token = CancellationToken::new();
        let mut feed = VecFeed::new((0..6).map(|i| row(i, "x")).collect());
        let mut sink = RecordingSink {
            fail_batches: vec![2],
            ..RecordingSink::default()
        };

        let report = processor(&limiter, &memory, 2)
            .run(
                &token,
                &mut feed,
                &mut sink,
                "appdb",
                "users",
                &columns(),
                InsertMode::Plain,
                |_, _| {},
            )
            .await
            .unwrap();

        assert_eq!(report.batches, 3);
        assert_eq!(report.processed_rows, 4);
        assert_eq!(report.failed_rows, 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_at_batch_boundary() {
        let limiter = RateLimiter::disabled();
        let memory = MemoryMonitor::new(1024 * MB);
        let token = CancellationToken::new();
        token.cancel();

        let mut feed = VecFeed::new((0..100).map(|i| row(i, "x")).collect());
        let mut sink = RecordingSink::default();

        let report = processor(&limiter, &memory, 10)
            .run(
                &token,
                &mut feed,
                &mut sink,
                "appdb",
                "users",
                &columns(),
                InsertMode::Plain,
                |_, _| {},
            )
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.batches, 0);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let limiter = RateLimiter::disabled();
        let memory = MemoryMonitor::new(1024 * MB);
        let token = CancellationToken::new();
        let mut feed = VecFeed::new((0..3).map(|i| row(i, "x")).collect());
        let mut sink = RecordingSink::default();

        let mut p = processor(&limiter, &memory, 2);
        p.dry_run = true;
        let report = p
            .run(
                &token,
                &mut feed,
                &mut sink,
                "appdb",
                "users",
                &columns(),
                InsertMode::Plain,
                |_, _| {},
            )
            .await
            .unwrap();

        assert_eq!(report.processed_rows, 3);
        assert!(sink.statements.is_empty());
    }

    #[tokio::test]
    async fn test_progress_callback_sees_running_totals() {
        let limiter = RateLimiter::disabled();
        let memory = MemoryMonitor::new(1024 * MB);
        let token = CancellationToken::new();
        let mut feed = VecFeed::new((0..4).map(|i| row(i, "x")).collect());
        let mut sink = RecordingSink::default();
        let mut seen = Vec::new();

        processor(&limiter, &memory, 2)
            .run(
                &token,
                &mut feed,
                &mut sink,
                "appdb",
                "users",
                &columns(),
                InsertMode::Plain,
                |processed, failed| seen.push((processed, failed)),
            )
            .await
            .unwrap();

        assert_eq!(seen, vec![(2, 0), (4, 0)]);
    }

    #[test]
    fn test_memory_monitor_pressure() {
        let monitor = MemoryMonitor::new(100);
        assert!(!monitor.is_pressed());
        monitor.reserve(81);
        assert!(monitor.is_pressed());
        assert_eq!(monitor.available(), 19);
        monitor.release(81);
        assert!(!monitor.is_pressed());
    }

    #[tokio::test]
    async fn test_wait_if_pressed_returns_when_released() {
        let monitor = std::sync::Arc::new(MemoryMonitor::new(100));
        let token = CancellationToken::new();
        monitor.reserve(90);

        let waiter = {
            let monitor = monitor.clone();
            let token = token.clone();
            tokio::spawn(async move { monitor.wait_if_pressed(&token).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.release(90);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should settle once pressure clears")
            .unwrap();
    }
}
