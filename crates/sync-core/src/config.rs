//! Sync configuration entities.
//!
//! A [`SyncConfig`] groups an ordered list of [`TableMapping`]s between one
//! source and one target connection. [`SyncOptions`] carries the per-config
//! tunables the engine consults during a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::ident::is_valid_identifier;

/// Endpoint for one database.
///
/// The `id` is an opaque unique key: two descriptors with identical endpoint
/// fields are still distinct configurations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Default database selected when a caller does not bind another one.
    pub database: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// Per-table sync mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Truncate-and-reload of the whole table.
    Full,
    /// Apply only rows changed since the last checkpoint.
    Incremental,
}

/// How primary-key collisions are resolved during incremental upserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Replace the target row with the incoming one.
    Overwrite,
    /// Keep the target row, suppress the collision.
    Skip,
    /// Surface the collision as an error.
    Fail,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::Overwrite
    }
}

/// Tunables attached to a [`SyncConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Starting batch size for data transfer. Must be at least 1.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum concurrent sub-operations inside one job.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Compress batch payloads on the wire.
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Skip target writes, log what would have happened.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_batch_size() -> usize {
    1000
}

fn default_max_concurrency() -> usize {
    1
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            compress: false,
            conflict_policy: ConflictPolicy::default(),
            dry_run: false,
        }
    }
}

/// One (source table, target table) pair inside a [`SyncConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapping {
    pub id: String,
    pub config_id: String,
    pub source_table: String,
    pub target_table: String,
    pub mode: SyncMode,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Optional row filter, embedded verbatim into `WHERE … AND (filter)`.
    /// Treated as trusted configuration, not user input.
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A named group of tables kept in sync as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub id: String,
    pub name: String,
    pub source_connection_id: String,
    pub target_connection_id: String,
    pub source_database: String,
    pub target_database: String,
    /// Mappings are processed in this order.
    pub mappings: Vec<TableMapping>,
    pub default_mode: SyncMode,
    /// Free-form schedule hint for an external scheduler.
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub options: SyncOptions,
}

/// Violations reported by [`SyncConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid database name: {0:?}")]
    InvalidDatabaseName(String),
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),
    #[error("duplicate source table in config: {0:?}")]
    DuplicateSourceTable(String),
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("config has no table mappings")]
    NoMappings,
}

impl SyncConfig {
    /// Check the structural invariants that do not require store access.
    ///
    /// Connection references are resolved by the store when the job runs;
    /// everything checkable from the config alone is checked here.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_identifier(&self.source_database) {
            return Err(ValidationError::InvalidDatabaseName(
                self.source_database.clone(),
            ));
        }
        // An empty target database falls back to the source database name at
        // sync time, so only a non-empty value is validated.
        if !self.target_database.is_empty() && !is_valid_identifier(&self.target_database) {
            return Err(ValidationError::InvalidDatabaseName(
                self.target_database.clone(),
            ));
        }
        if self.mappings.is_empty() {
            return Err(ValidationError::NoMappings);
        }
        if self.options.batch_size == 0 {
            return Err(ValidationError::ZeroBatchSize);
        }

        let mut seen = HashSet::new();
        for mapping in &self.mappings {
            for name in [&mapping.source_table, &mapping.target_table] {
                if !is_valid_identifier(name) {
                    return Err(ValidationError::InvalidTableName(name.clone()));
                }
            }
            if !seen.insert(mapping.source_table.as_str()) {
                return Err(ValidationError::DuplicateSourceTable(
                    mapping.source_table.clone(),
                ));
            }
        }

        Ok(())
    }

    /// Mappings with `enabled == true`, in config order.
    pub fn enabled_mappings(&self) -> impl Iterator<Item = &TableMapping> {
        self.mappings.iter().filter(|m| m.enabled)
    }

    /// Target database, defaulting to the source database name when unset.
    pub fn effective_target_database(&self) -> &str {
        if self.target_database.is_empty() {
            &self.source_database
        } else {
            &self.target_database
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(source: &str, target: &str) -> TableMapping {
        TableMapping {
            id: format!("map-{source}"),
            config_id: "cfg-1".to_string(),
            source_table: source.to_string(),
            target_table: target.to_string(),
            mode: SyncMode::Full,
            enabled: true,
            filter: None,
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            id: "cfg-1".to_string(),
            name: "orders".to_string(),
            source_connection_id: "src".to_string(),
            target_connection_id: "dst".to_string(),
            source_database: "appdb".to_string(),
            target_database: String::new(),
            mappings: vec![mapping("orders", "orders"), mapping("users", "users")],
            default_mode: SyncMode::Full,
            schedule: None,
            enabled: true,
            options: SyncOptions::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_effective_target_database_defaults_to_source() {
        let mut cfg = config();
        assert_eq!(cfg.effective_target_database(), "appdb");
        cfg.target_database = "mirror".to_string();
        assert_eq!(cfg.effective_target_database(), "mirror");
    }

    #[test]
    fn test_duplicate_source_table_rejected() {
        let mut cfg = config();
        cfg.mappings.push(mapping("orders", "orders_copy"));
        assert_eq!(
            cfg.validate(),
            Err(ValidationError::DuplicateSourceTable("orders".to_string()))
        );
    }

    #[test]
    fn test_bad_table_name_rejected() {
        let mut cfg = config();
        cfg.mappings[0].source_table = "1bad".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ValidationError::InvalidTableName(_))
        ));
    }

    #[test]
    fn test_bad_database_name_rejected() {
        let mut cfg = config();
        cfg.source_database = "app db".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ValidationError::InvalidDatabaseName(_))
        ));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut cfg = config();
        cfg.options.batch_size = 0;
        assert_eq!(cfg.validate(), Err(ValidationError::ZeroBatchSize));
    }

    #[test]
    fn test_enabled_mappings_preserve_order() {
        let mut cfg = config();
        cfg.mappings[0].enabled = false;
        let names: Vec<_> = cfg
            .enabled_mappings()
            .map(|m| m.source_table.as_str())
            .collect();
        assert_eq!(names, vec!["users"]);
    }

    #[test]
    fn test_sync_options_defaults() {
        let opts: SyncOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.batch_size, 1000);
        assert_eq!(opts.max_concurrency, 1);
        assert_eq!(opts.conflict_policy, ConflictPolicy::Overwrite);
        assert!(!opts.compress);
        assert!(!opts.dry_run);
    }
}
