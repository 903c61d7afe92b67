//! Control-plane session traits

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::types::Origin;
use lc_protocol::WorkspaceInstance;

/// Callback invoked after every silent transport reconnect
pub type ReconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Why a session stopped serving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called locally
    Shutdown,
    /// The remote rejected the credential while reconnecting
    CredentialRejected,
    /// The transport failed and cannot be recovered
    TransportFailed,
}

/// Stream of instance updates pushed by the control plane
///
/// Ends when the session closes.
#[derive(Debug)]
pub struct InstanceUpdates {
    rx: mpsc::Receiver<WorkspaceInstance>,
}

impl InstanceUpdates {
    /// Wrap a receiver fed by a session driver
    pub fn from_receiver(rx: mpsc::Receiver<WorkspaceInstance>) -> Self {
        Self { rx }
    }

    /// Wait for the next update; `None` once the session is gone
    pub async fn next(&mut self) -> Option<WorkspaceInstance> {
        self.rx.recv().await
    }
}

/// An authenticated session with the control plane
///
/// Calls made while the transport is reconnecting wait for the new
/// transport or fail with a timeout; callers never see the swap.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Scopes granted to the credential the session was opened with
    async fn token_scopes(&self) -> Result<Vec<String>, SessionError>;

    /// Latest instance of every workspace that has one
    async fn list_instances(&self) -> Result<Vec<WorkspaceInstance>, SessionError>;

    /// Token that lets the owner log into the SSH gateway of a workspace
    async fn owner_token(&self, workspace_id: &str) -> Result<String, SessionError>;

    /// Take the instance update stream; only one subscriber is allowed
    fn subscribe(&self) -> Result<InstanceUpdates, SessionError>;

    /// Wait until the session stops serving and report why
    async fn closed(&self) -> CloseReason;

    /// Close the session; pending calls fail with [`SessionError::Closed`]
    async fn close(&self);
}

/// Opens control-plane sessions
#[async_trait]
pub trait Connector: Send + Sync {
    /// Session type produced by this connector
    type Session: ControlPlane + 'static;

    /// Open a session with the given credential
    ///
    /// `on_reconnect` runs after every transparent reconnect of the
    /// returned session (not after the initial connect).
    async fn connect(
        &self,
        origin: &Origin,
        credential: &str,
        on_reconnect: ReconnectHandler,
    ) -> Result<Self::Session, SessionError>;
}
