//! Control-plane session client
//!
//! A [`RemoteSession`] is a JSON-RPC 2.0 client over one logical WebSocket
//! connection. The physical connection may be replaced underneath it: the
//! driver reconnects with the same credential and calls the reconnect
//! handler so the owner can resynchronize. Callers only ever see call
//! results, timeouts and the final [`CloseReason`].

mod transport;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use lc_core::config::BackoffConfig;
use lc_core::{
    CloseReason, CompanionConfig, Connector, ControlPlane, InstanceUpdates, Origin,
    ReconnectHandler, SessionError,
};
use lc_protocol::{
    ProtocolError, Request, RequestId, RpcErrorObject, WorkspaceInfo, WorkspaceInstance,
    CODE_FORBIDDEN, METHOD_GET_OWNER_TOKEN, METHOD_GET_TOKEN_SCOPES, METHOD_GET_WORKSPACES,
};

use transport::Driver;

/// Capacity of the instance update queue handed to the subscriber
const UPDATE_QUEUE: usize = 256;

/// Capacity of the outbound request queue
const OUTBOUND_QUEUE: usize = 64;

/// Workspaces requested per listing
const WORKSPACE_LIMIT: u32 = 100;

/// Settings of the session client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for a single RPC call
    pub rpc_timeout: Duration,
    /// Deadline for the WebSocket handshake
    pub handshake_timeout: Duration,
    /// Attempts for the initial connect
    pub connect_attempts: u32,
    /// Delay between connection attempts
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            connect_attempts: 5,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Derive client settings from the process configuration
    pub fn from_companion(config: &CompanionConfig) -> Self {
        Self {
            rpc_timeout: config.rpc_timeout,
            handshake_timeout: config.rpc_timeout,
            connect_attempts: config.connect_attempts,
            backoff: config.backoff.clone(),
        }
    }
}

/// Hash of a token as the control plane keys its scopes
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Map a JSON-RPC error object to a session error
pub(crate) fn rpc_error(err: RpcErrorObject) -> SessionError {
    if err.code == CODE_FORBIDDEN {
        SessionError::Unauthorized(err.message)
    } else {
        SessionError::Rpc {
            code: err.code,
            message: err.message,
        }
    }
}

type Waiter = oneshot::Sender<Result<Value, SessionError>>;

/// State shared between the session handle and its driver task
pub(crate) struct Shared {
    outbound: mpsc::Sender<String>,
    pub(crate) pending: DashMap<u64, Waiter>,
    next_id: AtomicU64,
    updates_rx: Mutex<Option<mpsc::Receiver<WorkspaceInstance>>>,
    pub(crate) subscribed: AtomicBool,
    pub(crate) cancel: CancellationToken,
    closed: watch::Sender<Option<CloseReason>>,
    rpc_timeout: Duration,
    token_hash: String,
}

impl Shared {
    /// Fail every call that is waiting for a response
    pub(crate) fn fail_pending(&self, err: impl Fn() -> SessionError) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, waiter)) = self.pending.remove(&id) {
                let _ = waiter.send(Err(err()));
            }
        }
    }

    /// Record the close reason and release everyone still waiting
    pub(crate) fn finish(&self, reason: CloseReason) {
        self.closed.send_replace(Some(reason));
        self.cancel.cancel();
        self.updates_rx.lock().take();
        self.fail_pending(|| SessionError::Closed);
    }
}

/// An open session with the control plane
pub struct RemoteSession {
    shared: Arc<Shared>,
}

impl RemoteSession {
    fn start(
        endpoint: String,
        credential: &str,
        config: &ClientConfig,
        on_reconnect: ReconnectHandler,
        stream: transport::WsStream,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_QUEUE);
        let (closed_tx, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            outbound: outbound_tx,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            updates_rx: Mutex::new(Some(updates_rx)),
            subscribed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            closed: closed_tx,
            rpc_timeout: config.rpc_timeout,
            token_hash: token_hash(credential),
        });

        let driver = Driver {
            endpoint,
            credential: credential.to_string(),
            handshake_timeout: config.handshake_timeout,
            backoff: config.backoff.clone(),
            on_reconnect,
            outbound: outbound_rx,
            updates: updates_tx,
        };
        tokio::spawn(driver.run(shared.clone(), stream));

        Self { shared }
    }

    /// Issue one JSON-RPC call and wait for its result
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, SessionError> {
        if self.shared.closed.borrow().is_some() {
            return Err(SessionError::Closed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let text = Request::new(RequestId(id), method, params).to_text()?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);

        if self.shared.outbound.send(text).await.is_err() {
            self.shared.pending.remove(&id);
            return Err(SessionError::Closed);
        }

        match tokio::time::timeout(self.shared.rpc_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => {
                self.shared.pending.remove(&id);
                tracing::debug!(method, id, "RPC call timed out");
                Err(SessionError::Timeout(self.shared.rpc_timeout))
            }
        }
    }
}

#[async_trait]
impl ControlPlane for RemoteSession {
    async fn token_scopes(&self) -> Result<Vec<String>, SessionError> {
        let value = self
            .call(METHOD_GET_TOKEN_SCOPES, json!([self.shared.token_hash]))
            .await?;
        Ok(serde_json::from_value(value).map_err(ProtocolError::from)?)
    }

    async fn list_instances(&self) -> Result<Vec<WorkspaceInstance>, SessionError> {
        let value = self
            .call(METHOD_GET_WORKSPACES, json!([{ "limit": WORKSPACE_LIMIT }]))
            .await?;
        let workspaces: Vec<WorkspaceInfo> =
            serde_json::from_value(value).map_err(ProtocolError::from)?;
        Ok(workspaces
            .into_iter()
            .filter_map(|info| info.latest_instance)
            .collect())
    }

    async fn owner_token(&self, workspace_id: &str) -> Result<String, SessionError> {
        let value = self
            .call(METHOD_GET_OWNER_TOKEN, json!([workspace_id]))
            .await?;
        Ok(serde_json::from_value(value).map_err(ProtocolError::from)?)
    }

    fn subscribe(&self) -> Result<InstanceUpdates, SessionError> {
        let rx = self
            .shared
            .updates_rx
            .lock()
            .take()
            .ok_or(SessionError::AlreadySubscribed)?;
        self.shared.subscribed.store(true, Ordering::Release);
        Ok(InstanceUpdates::from_receiver(rx))
    }

    async fn closed(&self) -> CloseReason {
        let mut rx = self.shared.closed.subscribe();
        let reason = match rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => *reason,
            Err(_) => None,
        };
        reason.unwrap_or(CloseReason::Shutdown)
    }

    async fn close(&self) {
        self.shared.cancel.cancel();
        self.closed().await;
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Opens sessions over WebSocket
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    config: ClientConfig,
}

impl WsConnector {
    /// Create a connector with the given client settings
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Session = RemoteSession;

    async fn connect(
        &self,
        origin: &Origin,
        credential: &str,
        on_reconnect: ReconnectHandler,
    ) -> Result<RemoteSession, SessionError> {
        let endpoint = origin.rpc_endpoint();
        tracing::info!(%endpoint, "Connecting to control plane");

        let stream = transport::open_with_retry(
            &endpoint,
            credential,
            self.config.handshake_timeout,
            &self.config.backoff,
            self.config.connect_attempts,
        )
        .await?;

        tracing::info!(%endpoint, "Connected to control plane");
        Ok(RemoteSession::start(
            endpoint,
            credential,
            &self.config,
            on_reconnect,
            stream,
        ))
    }
}
