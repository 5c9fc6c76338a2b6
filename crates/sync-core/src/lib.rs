//! Core data types for mysql-sync.
//!
//! This crate defines the configuration and job entities shared by the sync
//! engine and its collaborators:
//!
//! - [`ConnectionDescriptor`] - one database endpoint
//! - [`SyncConfig`] / [`TableMapping`] / [`SyncOptions`] - what to sync and how
//! - [`SyncJob`] / [`JobStatus`] / [`Progress`] - one execution of a config
//! - [`TableSchema`] and friends - introspected source table structure
//! - [`ident`] - MySQL identifier validation and backtick quoting
//!
//! Everything here is plain data: no I/O, no driver dependency. The engine
//! crates build on these types.

pub mod ident;

mod config;
mod job;
mod schema;

pub use config::{
    ConflictPolicy, ConnectionDescriptor, SyncConfig, SyncMode, SyncOptions, TableMapping,
    ValidationError,
};
pub use job::{JobStatus, Progress, SyncJob};
pub use schema::{ColumnSchema, IndexSchema, KeyKind, KeySchema, TableSchema};
