//! CLI configuration file loading.
//!
//! One YAML file declares the connections and the sync config the CLI
//! runs. References are checked at load time so a typo'd connection id
//! fails before any job is submitted.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use sync_core::{ConnectionDescriptor, SyncConfig};

/// Parsed contents of the `--config` file.
#[derive(Debug, Deserialize)]
pub struct FileConfig {
    pub connections: Vec<ConnectionDescriptor>,
    pub sync: SyncConfig,
}

/// Load and validate a config file.
pub fn load(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config = parse(&text)?;
    Ok(config)
}

fn parse(text: &str) -> Result<FileConfig> {
    let config: FileConfig = serde_yaml::from_str(text).context("failed to parse config file")?;

    config
        .sync
        .validate()
        .with_context(|| format!("invalid sync config {}", config.sync.id))?;

    for reference in [
        &config.sync.source_connection_id,
        &config.sync.target_connection_id,
    ] {
        if !config.connections.iter().any(|c| &c.id == reference) {
            bail!(
                "sync config {} references unknown connection {reference}",
                config.sync.id
            );
        }
    }

    Ok(config)
}
