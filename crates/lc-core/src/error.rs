//! Core error types for the local companion

use std::time::Duration;

use lc_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by the remote session client
#[derive(Error, Debug)]
pub enum SessionError {
    /// The control plane rejected the credential (HTTP 401/403 or RPC forbidden)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Connection could not be established or was lost
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote answered with a JSON-RPC error
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// No answer within the deadline
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The session has been closed
    #[error("Session closed")]
    Closed,

    /// The instance update stream was already taken
    #[error("Instance updates are already subscribed")]
    AlreadySubscribed,

    /// Origin cannot be turned into an RPC endpoint
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Wire-level error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// Whether this error means "credential bad" rather than "network bad"
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, SessionError::Unauthorized(_))
    }
}

/// Errors raised by a credential store
#[derive(Error, Debug)]
pub enum CredentialError {
    /// Backend (keyring, file) refused the operation
    #[error("Credential backend error: {0}")]
    Backend(String),

    /// Store is locked and needs user interaction
    #[error("Credential store locked: {0}")]
    Locked(String),
}

/// Errors raised by the interactive login flow
#[derive(Error, Debug)]
pub enum LoginError {
    /// User denied or the authorization server returned an error
    #[error("Authorization denied: {0}")]
    Denied(String),

    /// Callback never arrived
    #[error("Login timed out after {0:?}")]
    Timeout(Duration),

    /// Token exchange failed
    #[error("Token exchange failed: {0}")]
    Exchange(String),

    /// Local callback listener failed
    #[error("Login I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Origin URL cannot be parsed or has an unsupported shape
    #[error("Invalid origin {origin:?}: {reason}")]
    InvalidOrigin { origin: String, reason: String },

    /// Invalid configuration value
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors for explicit expose requests
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExposeError {
    /// Port value is outside the usable range
    #[error("Invalid port: {0}")]
    InvalidPort(u32),

    /// Instance identifier is empty or malformed
    #[error("Invalid instance id: {0:?}")]
    InvalidInstance(String),

    /// The instance is not tracked and the operation needs it to be
    #[error("Unknown instance: {0}")]
    UnknownInstance(String),

    /// No control-plane session is attached to answer the request
    #[error("Not connected to the control plane")]
    NotConnected,

    /// Refresh against the control plane failed
    #[error("Refresh failed: {0}")]
    RefreshFailed(String),
}
