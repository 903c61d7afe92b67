//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame is not a valid JSON-RPC 2.0 message
    #[error("Invalid JSON-RPC message: {0}")]
    InvalidMessage(String),

    /// Unsupported JSON-RPC version
    #[error("Unsupported JSON-RPC version: {0}")]
    UnsupportedVersion(String),

    /// Notification or result payload did not have the expected shape
    #[error("Unexpected payload for {method}: {reason}")]
    UnexpectedPayload { method: String, reason: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
