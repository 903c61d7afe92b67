//! Configuration management for the local companion

mod companion;
pub mod serde_utils;

pub use companion::{default_ssh_config_path, BackoffConfig, CompanionConfig, DEFAULT_API_PORT};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("local-companion")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Invalid(format!("Failed to read config {}: {}", path.display(), e))
    })?;

    let config: T = toml::from_str(&content)?;
    tracing::debug!(path = %path.display(), "Loaded configuration file");
    Ok(config)
}
