//! JSON-RPC 2.0 envelopes
//!
//! The control plane speaks JSON-RPC 2.0 over WebSocket text frames. Each
//! frame carries exactly one message: a response to one of our requests,
//! a server notification, or (rarely) a server-initiated request that we
//! answer with "method not found".

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::ProtocolError;

/// JSON-RPC protocol version carried on every message
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC code for an unknown method
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;

/// Identifier of a request we issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rpc-{}", self.0)
    }
}

/// Outgoing request
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    jsonrpc: &'static str,
    /// Request identifier, echoed back in the response
    pub id: RequestId,
    /// Method name
    pub method: String,
    /// Positional or named parameters
    pub params: Value,
}

impl Request {
    /// Create a new request
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }

    /// Serialize into a text frame
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Error object carried by a failed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    /// Error code (negative for protocol errors, HTTP-like for application errors)
    pub code: i64,
    /// Human-readable message
    pub message: String,
    /// Optional structured detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for RpcErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "jsonrpc2: code {} message: {}", self.code, self.message)
    }
}

/// Response to one of our requests
#[derive(Debug, Clone)]
pub struct Response {
    /// Identifier of the request this answers
    pub id: RequestId,
    /// Result value or error object
    pub result: Result<Value, RpcErrorObject>,
}

/// Server notification (no response expected)
#[derive(Debug, Clone)]
pub struct Notification {
    /// Method name
    pub method: String,
    /// Parameters as sent by the server
    pub params: Value,
}

impl Notification {
    /// Decode the first parameter.
    ///
    /// Accepts both positional (`[param]`) and bare-object parameters.
    pub fn first_param<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let value = match &self.params {
            Value::Array(items) => items.first().cloned().ok_or_else(|| {
                ProtocolError::UnexpectedPayload {
                    method: self.method.clone(),
                    reason: "empty parameter list".to_string(),
                }
            })?,
            Value::Object(_) => self.params.clone(),
            other => {
                return Err(ProtocolError::UnexpectedPayload {
                    method: self.method.clone(),
                    reason: format!("unsupported params shape: {}", other),
                })
            }
        };
        Ok(serde_json::from_value(value)?)
    }
}

/// Any message received from the server
#[derive(Debug, Clone)]
pub enum Incoming {
    /// Response to a request we issued
    Response(Response),
    /// Notification pushed by the server
    Notification(Notification),
    /// Server-initiated request; answered with [`method_not_found`]
    Request {
        /// Raw identifier, echoed back verbatim
        id: Value,
        /// Method name
        method: String,
    },
    /// Error response that could not be correlated (id was null)
    UncorrelatedError(RpcErrorObject),
}

impl Incoming {
    /// Decode a text frame
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::InvalidMessage(
                "message is not a JSON object".to_string(),
            ));
        };

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            Some(other) => return Err(ProtocolError::UnsupportedVersion(other.to_string())),
            None => {
                return Err(ProtocolError::InvalidMessage(
                    "missing jsonrpc version".to_string(),
                ))
            }
        }

        let id = obj.remove("id").filter(|id| !id.is_null());

        if let Some(method) = obj.remove("method") {
            let method = method
                .as_str()
                .ok_or_else(|| ProtocolError::InvalidMessage("method is not a string".to_string()))?
                .to_string();
            let params = obj.remove("params").unwrap_or(Value::Null);
            return Ok(match id {
                Some(id) => Incoming::Request { id, method },
                None => Incoming::Notification(Notification { method, params }),
            });
        }

        let error = match obj.remove("error") {
            Some(err) => Some(serde_json::from_value::<RpcErrorObject>(err)?),
            None => None,
        };

        let Some(id) = id else {
            return match error {
                Some(err) => Ok(Incoming::UncorrelatedError(err)),
                None => Err(ProtocolError::InvalidMessage(
                    "response without id".to_string(),
                )),
            };
        };

        let id = id
            .as_u64()
            .map(RequestId)
            .ok_or_else(|| ProtocolError::InvalidMessage(format!("unexpected response id {}", id)))?;

        let result = match error {
            Some(err) => Err(err),
            None => Ok(obj.remove("result").unwrap_or(Value::Null)),
        };

        Ok(Incoming::Response(Response { id, result }))
    }
}

/// Build the reply to a server-initiated request we do not implement
pub fn method_not_found(id: Value, method: &str) -> String {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": CODE_METHOD_NOT_FOUND,
            "message": format!("method not found: {}", method),
        }
    })
    .to_string()
}
