//! Companion configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;
use crate::types::Origin;

/// Default port of the local control API
pub const DEFAULT_API_PORT: u16 = 63100;

/// Log levels accepted for `log_level`
const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Configuration for the local companion process
///
/// Values come from built-in defaults, then an optional TOML file, then
/// environment variables and command line flags (flags win).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    /// URL of the control-plane installation to connect to
    pub gitpod_host: String,

    /// Port of the loopback control API
    pub api_port: u16,

    /// Forward ports the control plane reports as exposed
    pub auto_tunnel: bool,

    /// Accept browser origins carrying a `<port>-` prefix
    pub allow_cors_from_port: bool,

    /// Where the browser is sent after a successful login
    pub auth_redirect_url: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,

    /// SSH config file to maintain (None disables the writer)
    pub ssh_config: Option<PathBuf>,

    /// Keep the credential in memory instead of the OS keyring
    pub mock_keyring: bool,

    /// Backoff for transport reconnects
    pub backoff: BackoffConfig,

    /// Connection attempts before an initial connect is reported as failed
    pub connect_attempts: u32,

    /// Deadline for a single RPC call
    #[serde(with = "duration_secs")]
    pub rpc_timeout: Duration,

    /// Per-attempt deadline for liveness checks against the control plane
    #[serde(with = "duration_secs")]
    pub liveness_timeout: Duration,

    /// Attempts for liveness checks before giving up
    pub liveness_attempts: u32,

    /// How long an expose request for an unknown instance is kept
    #[serde(with = "duration_secs")]
    pub pending_expose_ttl: Duration,

    /// Keepalive ping interval on local API WebSocket streams
    #[serde(with = "duration_secs")]
    pub ws_ping_interval: Duration,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            gitpod_host: "https://gitpod.io".to_string(),
            api_port: DEFAULT_API_PORT,
            auto_tunnel: true,
            allow_cors_from_port: false,
            auth_redirect_url: None,
            log_level: "info".to_string(),
            ssh_config: Some(default_ssh_config_path()),
            mock_keyring: false,
            backoff: BackoffConfig::default(),
            connect_attempts: 5,
            rpc_timeout: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(3),
            liveness_attempts: 3,
            pending_expose_ttl: Duration::from_secs(300),
            ws_ping_interval: Duration::from_secs(15),
        }
    }
}

impl CompanionConfig {
    /// Validate the configuration, returning the parsed origin
    pub fn validate(&self) -> Result<Origin, ConfigError> {
        let origin = Origin::parse(&self.gitpod_host)?;

        if self.api_port == 0 {
            return Err(ConfigError::Invalid("api_port must not be 0".to_string()));
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.liveness_attempts == 0 {
            return Err(ConfigError::Invalid(
                "liveness_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(redirect) = &self.auth_redirect_url {
            url::Url::parse(redirect).map_err(|e| {
                ConfigError::Invalid(format!("auth_redirect_url {:?}: {}", redirect, e))
            })?;
        }
        self.backoff.validate()?;

        Ok(origin)
    }

    /// The log level as a tracing filter directive
    pub fn log_directive(&self) -> Result<String, ConfigError> {
        let level = self.log_level.trim().to_ascii_lowercase();
        if LOG_LEVELS.contains(&level.as_str()) {
            Ok(level)
        } else {
            Err(ConfigError::Invalid(format!(
                "unknown log level {:?}",
                self.log_level
            )))
        }
    }

    /// Address of the local control API (loopback only)
    pub fn api_address(&self) -> String {
        format!("127.0.0.1:{}", self.api_port)
    }
}

/// Default location of the generated SSH config
///
/// Honors `GITPOD_LCA_SSH_CONFIG`, falling back to a file in the temp dir.
pub fn default_ssh_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("GITPOD_LCA_SSH_CONFIG").filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    if cfg!(windows) {
        std::env::temp_dir().join("gitpod_ssh_config")
    } else {
        PathBuf::from("/tmp").join("gitpod_ssh_config")
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "backoff.multiplier must be >= 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(
                "backoff.jitter must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.initial > self.max {
            return Err(ConfigError::Invalid(
                "backoff.initial must not exceed backoff.max".to_string(),
            ));
        }
        Ok(())
    }
}
