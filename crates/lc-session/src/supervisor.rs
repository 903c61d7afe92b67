//! Connection supervisor
//!
//! Drives the credential lifecycle: load a stored token or log in, open a
//! session, validate the token's scopes, then hand the session to the
//! tunnel orchestrator until it ends. A rejected credential is deleted and
//! the cycle restarts with a fresh login.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use lc_bastion::Bastion;
use lc_core::{
    CloseReason, Connector, ControlPlane, CredentialStore, LoginError, LoginFlow, Origin,
    ReconnectHandler, SessionError, REQUIRED_SCOPES,
};

/// Errors that stop the supervisor
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The interactive login failed
    #[error("Login failed: {0}")]
    Login(#[from] LoginError),

    /// The session could not be opened for a reason other than the credential
    #[error("Failed to connect: {0}")]
    Connect(#[source] SessionError),

    /// Token validation failed for a reason other than the credential
    #[error("Failed to validate credential: {0}")]
    Validate(#[source] SessionError),

    /// The session ended with an unrecoverable transport failure
    #[error("Session ended: transport failed")]
    Session,
}

enum Step<S> {
    ObtainCredential,
    Connect { credential: String },
    Validate { session: Arc<S> },
    Serve { session: Arc<S> },
    Invalidate { session: Option<Arc<S>>, reason: String },
}

/// Shutdown was requested while waiting
struct Cancelled;

/// Credential lifecycle driver for one origin
pub struct Supervisor<C: Connector> {
    origin: Origin,
    connector: C,
    store: Arc<dyn CredentialStore>,
    login: Arc<dyn LoginFlow>,
    bastion: Arc<Bastion>,
    cancel: CancellationToken,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(
        origin: Origin,
        connector: C,
        store: Arc<dyn CredentialStore>,
        login: Arc<dyn LoginFlow>,
        bastion: Arc<Bastion>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            origin,
            connector,
            store,
            login,
            bastion,
            cancel,
        }
    }

    /// Run until cancelled or a fatal error occurs
    pub async fn run(&self) -> Result<(), SupervisorError> {
        let mut step = Step::ObtainCredential;

        loop {
            step = match step {
                Step::ObtainCredential => match self.obtain_credential().await {
                    Ok(Some(credential)) => Step::Connect { credential },
                    Ok(None) => return Ok(()),
                    Err(e) => return Err(e),
                },

                Step::Connect { credential } => {
                    let on_reconnect = self.reconnect_handler();
                    let connect = self.connector.connect(&self.origin, &credential, on_reconnect);
                    match self.unless_cancelled(connect).await {
                        Err(_) => return Ok(()),
                        Ok(Ok(session)) => Step::Validate {
                            session: Arc::new(session),
                        },
                        Ok(Err(e)) if e.is_unauthorized() => Step::Invalidate {
                            session: None,
                            reason: e.to_string(),
                        },
                        Ok(Err(e)) => return Err(SupervisorError::Connect(e)),
                    }
                }

                Step::Validate { session } => match session.token_scopes().await {
                    Ok(scopes) => match missing_scopes(&scopes) {
                        None => Step::Serve { session },
                        Some(missing) => Step::Invalidate {
                            session: Some(session),
                            reason: format!("credential lacks scopes: {}", missing.join(", ")),
                        },
                    },
                    Err(e) if e.is_unauthorized() => Step::Invalidate {
                        session: Some(session),
                        reason: e.to_string(),
                    },
                    Err(e) => {
                        session.close().await;
                        return Err(SupervisorError::Validate(e));
                    }
                },

                Step::Serve { session } => match self.serve(session).await {
                    CloseReason::Shutdown => return Ok(()),
                    CloseReason::CredentialRejected => Step::Invalidate {
                        session: None,
                        reason: "credential rejected while reconnecting".to_string(),
                    },
                    CloseReason::TransportFailed => return Err(SupervisorError::Session),
                },

                Step::Invalidate { session, reason } => {
                    tracing::warn!(origin = %self.origin, "Discarding credential: {}", reason);
                    if let Some(session) = session {
                        session.close().await;
                    }
                    if let Err(e) = self.store.delete(&self.origin).await {
                        tracing::warn!("Failed to delete stored credential: {}", e);
                    }
                    Step::ObtainCredential
                }
            };
        }
    }

    /// Stored credential or a fresh login; `None` when cancelled
    async fn obtain_credential(&self) -> Result<Option<String>, SupervisorError> {
        let stored = match self.unless_cancelled(self.store.get(&self.origin)).await {
            Err(_) => return Ok(None),
            Ok(Ok(stored)) => stored,
            Ok(Err(e)) => {
                tracing::warn!("Failed to read stored credential, logging in: {}", e);
                None
            }
        };

        if let Some(credential) = stored {
            tracing::debug!(origin = %self.origin, "Using stored credential");
            return Ok(Some(credential));
        }

        tracing::info!(origin = %self.origin, "No usable credential, starting login");
        let credential = match self.unless_cancelled(self.login.login(&self.origin)).await {
            Err(_) => return Ok(None),
            Ok(result) => result?,
        };

        if let Err(e) = self.store.set(&self.origin, &credential).await {
            tracing::warn!("Failed to store credential, continuing without it: {}", e);
        }
        Ok(Some(credential))
    }

    async fn serve(&self, session: Arc<C::Session>) -> CloseReason {
        let updates = match session.subscribe() {
            Ok(updates) => updates,
            Err(e) => {
                tracing::error!("Cannot subscribe to instance updates: {}", e);
                session.close().await;
                return CloseReason::TransportFailed;
            }
        };

        self.bastion.attach(session.clone());
        match self.bastion.resync().await {
            Ok(summary) => tracing::info!(
                instances = summary.instances,
                tunnels = summary.tunnels,
                "Initial resync complete"
            ),
            Err(e) => tracing::warn!("Initial resync failed: {}", e),
        }

        let reason = tokio::select! {
            _ = self.bastion.serve(updates) => session.closed().await,
            reason = session.closed() => reason,
            _ = self.cancel.cancelled() => {
                session.close().await;
                CloseReason::Shutdown
            }
        };

        self.bastion.detach();
        tracing::info!(?reason, "Session ended");
        reason
    }

    fn reconnect_handler(&self) -> ReconnectHandler {
        let bastion = self.bastion.clone();
        Arc::new(move || bastion.request_resync())
    }

    async fn unless_cancelled<T>(&self, fut: impl Future<Output = T>) -> Result<T, Cancelled> {
        tokio::select! {
            value = fut => Ok(value),
            _ = self.cancel.cancelled() => {
                tracing::debug!("Supervisor cancelled");
                Err(Cancelled)
            }
        }
    }
}

/// Scopes from [`REQUIRED_SCOPES`] absent from `granted`
pub fn missing_scopes(granted: &[String]) -> Option<Vec<&'static str>> {
    let missing: Vec<&'static str> = REQUIRED_SCOPES
        .iter()
        .copied()
        .filter(|required| !granted.iter().any(|g| g == required))
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(missing)
    }
}
