//! Configuration management for booktran
//!
//! The coordinator reads a single configuration bag, either TOML or JSON,
//! chosen by file extension. Keys are camelCase; any unrecognized key is a
//! parse error. After parsing, [`EngineConfig::validate`] checks value
//! ranges and reports the offending field.

mod engine;
mod worker;

pub use engine::{BackoffConfig, EngineConfig, ResultCacheConfig, SnapshotFile};
pub use worker::{Credential, Secret, WorkerDescriptor};

use crate::error::ConfigError;
use std::path::Path;

/// Load and validate configuration from a file
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let config = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => parse_toml(&content)?,
        Some("json") => parse_json(&content)?,
        _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
    };

    tracing::debug!(
        "Loaded config from {:?}: {} workers, {} snapshot files",
        path,
        config.workers.len(),
        config.snapshot_files.len()
    );
    Ok(config)
}

/// Parse and validate a TOML configuration document
pub fn parse_toml(content: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Parse and validate a JSON configuration document
pub fn parse_json(content: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = serde_json::from_str(content)?;
    config.validate()?;
    Ok(config)
}
