//! SSH gateway dialer
//!
//! One SSH session per instance to `<workspaceId>.ssh.<cluster host>`,
//! authenticated as the workspace id with the workspace owner token. Every
//! local connection gets its own `direct-tcpip` channel on that session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client::{self, Config, Handle};
use russh::Disconnect;
use russh_keys::key::PublicKey;

use lc_core::InstanceId;

use super::{TunnelDialer, TunnelStream};
use crate::bastion::SourceSlot;
use crate::tunnel::Tunnel;

/// Port of the workspace SSH gateway
pub const GATEWAY_PORT: u16 = 22;

/// Deadline for TCP connect and SSH handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

struct GatewayHandler {
    host: String,
}

#[async_trait]
impl client::Handler for GatewayHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        // Gateway host keys are not published; log the fingerprint and go on
        tracing::debug!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "SSH gateway host key"
        );
        Ok(true)
    }
}

type GatewaySession = Arc<Handle<GatewayHandler>>;

/// Dials instance ports through the workspace SSH gateway
pub struct SshDialer {
    source: SourceSlot,
    port: u16,
    config: Arc<Config>,
    sessions: Mutex<HashMap<InstanceId, GatewaySession>>,
}

impl SshDialer {
    /// Dialer fetching owner tokens from the session in `source`
    pub fn new(source: SourceSlot) -> Self {
        Self::with_port(source, GATEWAY_PORT)
    }

    /// Dialer for a gateway listening on a non-standard port
    pub fn with_port(source: SourceSlot, port: u16) -> Self {
        Self {
            source,
            port,
            config: Arc::new(Config::default()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn session(&self, tunnel: &Tunnel) -> anyhow::Result<GatewaySession> {
        let cached = self
            .sessions
            .lock()
            .get(&tunnel.instance_id)
            .filter(|session| !session.is_closed())
            .cloned();
        if let Some(session) = cached {
            return Ok(session);
        }

        let session = Arc::new(self.connect(tunnel).await?);

        let mut sessions = self.sessions.lock();
        match sessions.get(&tunnel.instance_id) {
            // Another connection won the race
            Some(existing) if !existing.is_closed() => Ok(existing.clone()),
            _ => {
                sessions.insert(tunnel.instance_id.clone(), session.clone());
                Ok(session)
            }
        }
    }

    async fn connect(&self, tunnel: &Tunnel) -> anyhow::Result<Handle<GatewayHandler>> {
        let source = self
            .source
            .get()
            .context("Not connected to the control plane")?;
        let user = tunnel.workspace_id.as_str();
        let token = source
            .owner_token(user)
            .await
            .with_context(|| format!("Failed to fetch owner token for {}", user))?;

        tracing::debug!(host = %tunnel.hostname, port = self.port, "Connecting to SSH gateway");
        let handler = GatewayHandler {
            host: tunnel.hostname.clone(),
        };
        let mut handle = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(
                self.config.clone(),
                (tunnel.hostname.as_str(), self.port),
                handler,
            ),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Timed out connecting to {}", tunnel.hostname))?
        .with_context(|| format!("Failed to connect to {}:{}", tunnel.hostname, self.port))?;

        let accepted = handle
            .authenticate_password(user, token)
            .await
            .context("SSH authentication error")?;
        if !accepted {
            anyhow::bail!("SSH gateway rejected the owner token of {}", user);
        }

        tracing::info!(instance = %tunnel.instance_id, host = %tunnel.hostname, "SSH gateway session open");
        Ok(handle)
    }
}

#[async_trait]
impl TunnelDialer for SshDialer {
    async fn dial(&self, tunnel: &Tunnel, target_port: u16) -> anyhow::Result<TunnelStream> {
        let session = self.session(tunnel).await?;
        let channel = session
            .channel_open_direct_tcpip("localhost", u32::from(target_port), "127.0.0.1", 0)
            .await
            .with_context(|| {
                format!(
                    "Failed to open channel to port {} of {}",
                    target_port,
                    tunnel.host_alias()
                )
            })?;
        Ok(Box::pin(channel.into_stream()))
    }

    async fn release(&self, instance_id: &InstanceId) {
        let session = self.sessions.lock().remove(instance_id);
        if let Some(session) = session {
            if let Err(e) = session
                .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
                .await
            {
                tracing::debug!(instance = %instance_id, "SSH disconnect failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn tunnel() -> Tunnel {
        let inst: lc_protocol::WorkspaceInstance = serde_json::from_value(serde_json::json!({
            "id": "i1",
            "workspaceId": "ws1",
            "status": {"phase": "running"}
        }))
        .unwrap();
        Tunnel::derive(&inst, &BTreeMap::new(), "gitpod.example.com")
    }

    #[tokio::test]
    async fn test_dial_without_session_fails() {
        let dialer = SshDialer::new(SourceSlot::new());
        let err = match dialer.dial(&tunnel(), 3000).await {
            Ok(_) => panic!("dial must fail without a control-plane session"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("Not connected"));
    }

    #[tokio::test]
    async fn test_release_unknown_instance_is_noop() {
        let dialer = SshDialer::with_port(SourceSlot::new(), 2222);
        dialer.release(&InstanceId::from("i1")).await;
        assert!(dialer.sessions.lock().is_empty());
    }
}
