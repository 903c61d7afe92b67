//! WebSocket transport and session driver
//!
//! The driver task owns the socket. It writes queued requests, routes
//! responses to waiting callers, forwards instance updates and answers
//! server-initiated requests. When the socket drops it fails the calls that
//! were in flight, reconnects with backoff using the same credential and
//! runs the reconnect callback.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use lc_core::config::BackoffConfig;
use lc_core::{CloseReason, ReconnectHandler, SessionError};
use lc_protocol::jsonrpc::method_not_found;
use lc_protocol::{Incoming, WorkspaceInstance, NOTIFY_INSTANCE_UPDATE};

use super::{rpc_error, Shared};
use crate::backoff::ExponentialBackoff;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Interval between client keepalive pings
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Silence after which the connection is considered dead
const IDLE_TIMEOUT: Duration = Duration::from_secs(75);

/// Build the handshake request carrying the bearer credential
fn build_request(endpoint: &str, credential: &str) -> Result<Request, SessionError> {
    let mut request = endpoint
        .into_client_request()
        .map_err(|e| SessionError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", credential))
        .map_err(|_| SessionError::Unauthorized("credential is not a valid header value".into()))?;
    request.headers_mut().insert(header::AUTHORIZATION, bearer);
    Ok(request)
}

/// Open one WebSocket connection
///
/// HTTP 401/403 on the handshake is reported as [`SessionError::Unauthorized`].
pub(crate) async fn open(
    endpoint: &str,
    credential: &str,
    handshake_timeout: Duration,
) -> Result<WsStream, SessionError> {
    let request = build_request(endpoint, credential)?;

    let connect = tokio_tungstenite::connect_async(request);
    let (stream, _response) = match tokio::time::timeout(handshake_timeout, connect).await {
        Ok(Ok(ok)) => ok,
        Ok(Err(tungstenite::Error::Http(response))) => {
            let status = response.status();
            return Err(
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    SessionError::Unauthorized(format!("handshake rejected with {}", status))
                } else {
                    SessionError::Transport(format!("handshake failed with {}", status))
                },
            );
        }
        Ok(Err(tungstenite::Error::Url(e))) => {
            return Err(SessionError::InvalidEndpoint(e.to_string()));
        }
        Ok(Err(e)) => return Err(SessionError::Transport(e.to_string())),
        Err(_) => return Err(SessionError::Timeout(handshake_timeout)),
    };
    Ok(stream)
}

/// Open the first connection, retrying transport errors up to `attempts` times
pub(crate) async fn open_with_retry(
    endpoint: &str,
    credential: &str,
    handshake_timeout: Duration,
    backoff: &BackoffConfig,
    attempts: u32,
) -> Result<WsStream, SessionError> {
    let mut backoff = ExponentialBackoff::from_config(backoff);
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match open(endpoint, credential, handshake_timeout).await {
            Ok(stream) => return Ok(stream),
            Err(e @ (SessionError::Unauthorized(_) | SessionError::InvalidEndpoint(_))) => {
                return Err(e)
            }
            Err(e) if attempt >= attempts => {
                tracing::warn!(endpoint, attempts, "Giving up connecting: {}", e);
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::info!(
                    endpoint,
                    attempt,
                    "Connection failed: {}. Retrying in {:?}",
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Everything the driver needs besides the shared session state
pub(crate) struct Driver {
    pub endpoint: String,
    pub credential: String,
    pub handshake_timeout: Duration,
    pub backoff: BackoffConfig,
    pub on_reconnect: ReconnectHandler,
    pub outbound: mpsc::Receiver<String>,
    pub updates: mpsc::Sender<WorkspaceInstance>,
}

enum Disconnect {
    Shutdown,
    Dropped(String),
}

impl Driver {
    /// Run until the session is closed or cannot be recovered
    pub async fn run(mut self, shared: Arc<Shared>, mut stream: WsStream) {
        let reason = loop {
            match self.pump(&shared, &mut stream).await {
                Disconnect::Shutdown => {
                    let _ = stream.close(None).await;
                    break CloseReason::Shutdown;
                }
                Disconnect::Dropped(why) => {
                    tracing::warn!("Connection to control plane lost: {}", why);
                    shared.fail_pending(|| SessionError::Transport(format!("connection lost: {}", why)));

                    match self.reconnect(&shared).await {
                        Ok(next) => {
                            stream = next;
                            tracing::info!("Reconnected to control plane");
                            (self.on_reconnect)();
                        }
                        Err(reason) => break reason,
                    }
                }
            }
        };

        shared.finish(reason);
        tracing::debug!(?reason, "Session driver stopped");
    }

    async fn reconnect(&self, shared: &Shared) -> Result<WsStream, CloseReason> {
        let mut backoff = ExponentialBackoff::from_config(&self.backoff);
        loop {
            let delay = backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shared.cancel.cancelled() => return Err(CloseReason::Shutdown),
            }

            let attempt = tokio::select! {
                result = open(&self.endpoint, &self.credential, self.handshake_timeout) => result,
                _ = shared.cancel.cancelled() => return Err(CloseReason::Shutdown),
            };

            match attempt {
                Ok(stream) => return Ok(stream),
                Err(SessionError::Unauthorized(msg)) => {
                    tracing::warn!("Credential rejected while reconnecting: {}", msg);
                    return Err(CloseReason::CredentialRejected);
                }
                Err(SessionError::InvalidEndpoint(msg)) => {
                    tracing::error!("Cannot reconnect: {}", msg);
                    return Err(CloseReason::TransportFailed);
                }
                Err(e) => {
                    tracing::debug!(attempt = backoff.attempt(), "Reconnect attempt failed: {}", e);
                }
            }
        }
    }

    async fn pump(&mut self, shared: &Shared, stream: &mut WsStream) -> Disconnect {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => return Disconnect::Shutdown,

                outbound = self.outbound.recv() => {
                    let Some(text) = outbound else {
                        return Disconnect::Shutdown;
                    };
                    if let Err(e) = stream.send(Message::Text(text)).await {
                        return Disconnect::Dropped(e.to_string());
                    }
                }

                incoming = stream.next() => {
                    last_seen = Instant::now();
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = self.handle_text(shared, &text) {
                                if let Err(e) = stream.send(Message::Text(reply)).await {
                                    return Disconnect::Dropped(e.to_string());
                                }
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let why = frame
                                .map(|f| format!("closed by server ({}: {})", f.code, f.reason))
                                .unwrap_or_else(|| "closed by server".to_string());
                            return Disconnect::Dropped(why);
                        }
                        // Pings are answered by tungstenite
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Disconnect::Dropped(e.to_string()),
                        None => return Disconnect::Dropped("stream ended".to_string()),
                    }
                }

                _ = keepalive.tick() => {
                    if last_seen.elapsed() > IDLE_TIMEOUT {
                        return Disconnect::Dropped(format!("no traffic for {:?}", last_seen.elapsed()));
                    }
                    if let Err(e) = stream.send(Message::Ping(Vec::new())).await {
                        return Disconnect::Dropped(e.to_string());
                    }
                }
            }
        }
    }

    /// Handle one text frame; returns a reply to send, if any
    fn handle_text(&self, shared: &Shared, text: &str) -> Option<String> {
        match Incoming::decode(text) {
            Ok(Incoming::Response(response)) => {
                match shared.pending.remove(&response.id.0) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(response.result.map_err(rpc_error));
                    }
                    None => tracing::debug!(id = %response.id, "Response for unknown request"),
                }
                None
            }
            Ok(Incoming::Notification(notification)) => {
                if notification.method == NOTIFY_INSTANCE_UPDATE {
                    match notification.first_param::<WorkspaceInstance>() {
                        Ok(instance) => self.forward_update(shared, instance),
                        Err(e) => tracing::warn!("Malformed instance update: {}", e),
                    }
                } else {
                    tracing::trace!(method = %notification.method, "Ignoring notification");
                }
                None
            }
            Ok(Incoming::Request { id, method }) => {
                tracing::debug!(%method, "Rejecting server-initiated request");
                Some(method_not_found(id, &method))
            }
            Ok(Incoming::UncorrelatedError(err)) => {
                tracing::warn!("Control plane reported an error: {}", err);
                None
            }
            Err(e) => {
                tracing::warn!("Malformed message from control plane: {}", e);
                None
            }
        }
    }

    fn forward_update(&self, shared: &Shared, instance: WorkspaceInstance) {
        if !shared.subscribed.load(Ordering::Acquire) {
            tracing::trace!(instance = %instance.id, "No subscriber, dropping instance update");
            return;
        }
        match self.updates.try_send(instance) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(instance)) => {
                // The resync that follows repairs whatever was dropped
                tracing::warn!(instance = %instance.id, "Update queue full, requesting resync");
                (self.on_reconnect)();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
