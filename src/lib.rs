//! mysql-sync library.
//!
//! Synchronizes tables from a remote source MySQL database into a local
//! target, as restartable jobs over a worker pool.
//!
//! The pieces, bottom-up:
//!
//! - [`classify`] / [`retry`] - error taxonomy and exponential backoff
//! - [`optimize`] - compression, rate limiting, connection pool, schema cache
//! - [`batch`] - adaptive, memory-aware batched row transfer
//! - [`mysql`] - schema introspection, target DDL, full/incremental sync,
//!   validation
//! - [`executor`] - the per-job state machine with checkpoint resume
//! - [`engine`] - bounded job queue and the long-lived worker pool
//! - [`store`] / [`progress`] - contracts for the external config
//!   repository and monitoring sink

pub mod batch;
pub mod classify;
pub mod config;
pub mod engine;
pub mod executor;
pub mod mysql;
pub mod optimize;
pub mod progress;
pub mod retry;
pub mod store;
pub mod sync;

pub use engine::{EngineConfig, JobEngine};
pub use executor::JobExecutor;
pub use mysql::{MysqlTableSyncer, SyncContext};
pub use progress::{LoggingProgressSink, NoopProgressSink, ProgressSink};
pub use store::{ConfigStore, MemoryConfigStore};
pub use sync::{TableOutcome, TableSyncer};
