//! Local control API messages
//!
//! Browser-hosted tools and local CLIs talk to the companion over the
//! loopback API, either as plain HTTP JSON bodies or as JSON frames on the
//! WebSocket endpoint. The WebSocket framing uses the tagged enums below;
//! the HTTP routes reuse the same payload structs.

use serde::{Deserialize, Serialize};

/// Request from a local tool to the companion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocalRequest {
    /// Expose a workspace port on a local port
    ExposePort {
        #[serde(rename = "instanceId")]
        instance_id: String,
        /// Local port to listen on
        port: u32,
        /// Port inside the workspace (defaults to `port`)
        #[serde(rename = "targetPort", default)]
        target_port: Option<u32>,
    },

    /// Re-fetch instance state from the control plane
    Refresh,

    /// Report tunnel state, optionally for a single instance
    TunnelStatus {
        #[serde(rename = "instanceId", default)]
        instance_id: Option<String>,
    },

    /// Enable or disable automatic tunneling of remote-exposed ports
    AutoTunnel {
        #[serde(rename = "instanceId")]
        instance_id: String,
        enabled: bool,
    },

    /// Resolve how to reach an instance over SSH
    ResolveSshConnection {
        #[serde(rename = "instanceId")]
        instance_id: String,
    },

    /// Keepalive
    Ping,
}

/// Response from the companion to a local tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocalResponse {
    /// Generic success
    Ok,

    /// Result of an expose request; `pending` if the instance is not tracked yet
    Exposed { pending: bool },

    /// Result of a refresh
    Refreshed { instances: usize, tunnels: usize },

    /// Tunnel status listing
    Tunnels { tunnels: Vec<TunnelStatus> },

    /// SSH connection details
    SshConnection(SshConnection),

    /// Request failed
    Error { message: String },

    /// Keepalive reply
    Pong,
}

impl LocalResponse {
    /// Build an error response
    pub fn error(message: impl Into<String>) -> Self {
        LocalResponse::Error {
            message: message.into(),
        }
    }
}

/// A single forwarded port within a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStatus {
    /// Local port
    pub local_port: u16,
    /// Port inside the workspace
    pub target_port: u16,
    /// Whether the port was requested explicitly (vs. discovered)
    pub explicit: bool,
}

/// Tunnel state of one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    /// Instance identifier
    pub instance_id: String,
    /// Workspace identifier
    pub workspace_id: String,
    /// SSH host alias in the generated config
    pub host: String,
    /// Current instance phase
    pub phase: String,
    /// Forwarded ports
    pub forwards: Vec<ForwardStatus>,
}

/// How to reach an instance over SSH
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConnection {
    /// Host alias to pass to `ssh`
    pub host: String,
    /// SSH config file that defines the alias
    pub config_file: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expose_port_wire_shape() {
        let req: LocalRequest = serde_json::from_str(
            r#"{"type":"expose_port","instanceId":"i-1","port":8080}"#,
        )
        .unwrap();
        assert_eq!(
            req,
            LocalRequest::ExposePort {
                instance_id: "i-1".to_string(),
                port: 8080,
                target_port: None,
            }
        );
    }

    #[test]
    fn test_exposed_response_shape() {
        let json = serde_json::to_value(LocalResponse::Exposed { pending: true }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "exposed", "pending": true}));
    }

    #[test]
    fn test_error_response_shape() {
        let json = serde_json::to_value(LocalResponse::error("bad port")).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "bad port");
    }

    #[test]
    fn test_tunnel_status_camel_case() {
        let status = TunnelStatus {
            instance_id: "i".into(),
            workspace_id: "w".into(),
            host: "w".into(),
            phase: "running".into(),
            forwards: vec![ForwardStatus {
                local_port: 1,
                target_port: 2,
                explicit: true,
            }],
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["instanceId"], "i");
        assert_eq!(json["forwards"][0]["localPort"], 1);
    }
}
