//! Local companion
//!
//! Connects to a control-plane installation, keeps local tunnels and an SSH
//! config in sync with the user's running workspaces, and serves a loopback
//! control API for browser-hosted tools.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lc_bastion::cleanup::run_pending_cleanup;
use lc_bastion::{
    ApiServer, ApiState, Bastion, BastionConfig, LogObserver, ObserverSet, OriginGate,
    PortForwarder, Snapshot, SourceSlot, SshConfigWriter, SshDialer,
};
use lc_core::config::{self, CompanionConfig};
use lc_core::CredentialStore;
use lc_session::{
    BrowserLogin, ClientConfig, KeyringStore, MemoryCredentialStore, Supervisor, WsConnector,
};

#[derive(Parser, Debug)]
#[command(name = "local-companion")]
#[command(about = "Connect your cloud workspaces: port tunnels, SSH config and a local control API")]
#[command(version)]
struct Args {
    /// URL of the installation to connect to
    #[arg(long, env = "GITPOD_HOST")]
    gitpod_host: Option<String>,

    /// Port of the local control API
    #[arg(long, env = "GITPOD_LCA_API_PORT")]
    api_port: Option<u16>,

    /// Forward ports the workspaces expose
    #[arg(
        long,
        env = "GITPOD_LCA_AUTO_TUNNEL",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    auto_tunnel: Option<bool>,

    /// Allow CORS requests from workspace port locations
    #[arg(long)]
    allow_cors_from_port: bool,

    /// Where the browser is sent after a successful login
    #[arg(long, env = "GITPOD_LCA_AUTH_REDIRECT_URL")]
    auth_redirect_url: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "GITPOD_LCA_LOG_LEVEL")]
    log_level: Option<String>,

    /// OpenSSH compatible config file to maintain (empty disables it)
    #[arg(long, alias = "ssh_config", env = "GITPOD_LCA_SSH_CONFIG")]
    ssh_config: Option<String>,

    /// Keep the token in memory instead of the system keyring
    #[arg(long)]
    mock_keyring: bool,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    /// Layer flags and environment variables over the file configuration
    fn apply(self, mut config: CompanionConfig) -> CompanionConfig {
        if let Some(host) = self.gitpod_host {
            config.gitpod_host = host;
        }
        if let Some(port) = self.api_port {
            config.api_port = port;
        }
        if let Some(auto_tunnel) = self.auto_tunnel {
            config.auto_tunnel = auto_tunnel;
        }
        if self.allow_cors_from_port {
            config.allow_cors_from_port = true;
        }
        if let Some(url) = self.auth_redirect_url.filter(|u| !u.is_empty()) {
            config.auth_redirect_url = Some(url);
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(path) = self.ssh_config {
            config.ssh_config = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }
        if self.mock_keyring {
            config.mock_keyring = true;
        }
        config
    }
}

/// Read the configuration file
///
/// An explicit `--config` must load; a broken default file is reported and
/// skipped once logging is up.
fn load_file_config(explicit: Option<&PathBuf>) -> Result<(CompanionConfig, Option<String>)> {
    if let Some(path) = explicit {
        let config = config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?;
        return Ok((config, None));
    }

    let default_path = config::default_config_path();
    if !default_path.exists() {
        return Ok((CompanionConfig::default(), None));
    }
    match config::load_config(&default_path) {
        Ok(config) => Ok((config, None)),
        Err(e) => Ok((
            CompanionConfig::default(),
            Some(format!("Failed to load config from {:?}: {}", default_path, e)),
        )),
    }
}

fn init_logging(config: &CompanionConfig) {
    let (directive, level_error) = match config.log_directive() {
        Ok(directive) => (directive, None),
        Err(e) => ("info".to_string(), Some(e)),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or(directive),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(e) = level_error {
        tracing::error!(log_level = %config.log_level, "Failed to parse log level, using info: {}", e);
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (file_config, file_warning) = load_file_config(args.config.as_ref())?;
    let config = args.apply(file_config);

    init_logging(&config);
    if let Some(warning) = file_warning {
        tracing::warn!("{}", warning);
    }

    let origin = config.validate().context("Invalid configuration")?;
    tracing::info!(%origin, "Local companion starting...");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    // Observers
    let source = SourceSlot::new();
    let mut observers = ObserverSet::new();
    observers.register(Arc::new(LogObserver::new()))?;
    observers.register(Arc::new(PortForwarder::new(Arc::new(SshDialer::new(
        source.clone(),
    )))))?;
    if let Some(path) = &config.ssh_config {
        let writer = Arc::new(SshConfigWriter::new(path.clone()));
        writer
            .write(&Snapshot::default())
            .await
            .with_context(|| format!("Failed to write SSH config {}", path.display()))?;
        observers.register(writer)?;
        tracing::info!(path = %path.display(), "Writing workspace SSH config");
    }

    let bastion = Bastion::with_source(
        BastionConfig::from_companion(&config, &origin),
        observers,
        source,
    );

    // Local control API
    let gate = OriginGate::new(origin.hostname(), config.allow_cors_from_port)
        .context("Failed to build origin gate")?;
    let state = ApiState {
        bastion: bastion.clone(),
        gate: Arc::new(gate),
        ssh_config: config.ssh_config.clone(),
        ping_interval: config.ws_ping_interval,
    };
    let api = ApiServer::new(config.api_address(), state).with_shutdown_token(cancel.clone());
    let mut api_task = tokio::spawn(api.run());

    let cleanup_task = tokio::spawn(run_pending_cleanup(bastion.clone(), cancel.clone()));

    // Connection supervisor
    let store: Arc<dyn CredentialStore> = if config.mock_keyring {
        tracing::info!("Using in-memory credential store");
        Arc::new(MemoryCredentialStore::new())
    } else {
        Arc::new(KeyringStore::default())
    };
    let login = Arc::new(BrowserLogin::new(config.auth_redirect_url.clone()));
    let supervisor = Supervisor::new(
        origin,
        WsConnector::new(ClientConfig::from_companion(&config)),
        store,
        login,
        bastion.clone(),
        cancel.clone(),
    );

    let mut api_done = false;
    let outcome = tokio::select! {
        result = supervisor.run() => result.context("Connection to the control plane failed"),
        result = &mut api_task => {
            api_done = true;
            match result {
                Ok(Ok(())) if cancel.is_cancelled() => Ok(()),
                Ok(Ok(())) => Err(anyhow::anyhow!("Local API stopped unexpectedly")),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("Local API task failed: {}", e)),
            }
        }
    };

    cancel.cancel();
    if !api_done {
        if let Ok(Err(e)) = api_task.await {
            tracing::warn!("Local API shut down with error: {}", e);
        }
    }
    let _ = cleanup_task.await;
    bastion.settled().await;

    match &outcome {
        Ok(()) => tracing::info!("Local companion shutdown complete"),
        Err(e) => tracing::error!("Local companion stopped: {:#}", e),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["local-companion"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_flags_override_file_config() {
        let file = CompanionConfig {
            gitpod_host: "https://file.example.com".to_string(),
            api_port: 7000,
            ..CompanionConfig::default()
        };
        let config = parse(&["--gitpod-host", "https://flag.example.com", "--auto-tunnel", "false"])
            .apply(file);

        assert_eq!(config.gitpod_host, "https://flag.example.com");
        assert_eq!(config.api_port, 7000);
        assert!(!config.auto_tunnel);
    }

    #[test]
    fn test_bare_auto_tunnel_flag_enables() {
        let file = CompanionConfig {
            auto_tunnel: false,
            ..CompanionConfig::default()
        };
        assert!(parse(&["--auto-tunnel"]).apply(file).auto_tunnel);
    }

    #[test]
    fn test_auto_tunnel_accepts_boolish_values() {
        for (value, expected) in [("0", false), ("1", true), ("t", true), ("no", false), ("On", true)] {
            let cli = parse(&["--auto-tunnel", value]);
            assert_eq!(cli.auto_tunnel, Some(expected), "value {:?}", value);
        }
        assert!(Args::try_parse_from(["local-companion", "--auto-tunnel", "maybe"]).is_err());
    }

    #[test]
    fn test_empty_ssh_config_disables_writer() {
        let config = parse(&["--ssh-config", ""]).apply(CompanionConfig::default());
        assert!(config.ssh_config.is_none());

        let config = parse(&["--ssh_config", "/tmp/x"]).apply(CompanionConfig::default());
        assert_eq!(config.ssh_config, Some(PathBuf::from("/tmp/x")));
    }

    #[test]
    fn test_explicit_config_file_must_load() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(load_file_config(Some(&missing)).is_err());

        let path = dir.path().join("config.toml");
        std::fs::write(&path, "api_port = 7100\nmock_keyring = true\n").unwrap();
        let (config, warning) = load_file_config(Some(&path)).unwrap();
        assert_eq!(config.api_port, 7100);
        assert!(config.mock_keyring);
        assert!(warning.is_none());
    }
}
