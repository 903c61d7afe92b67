//! lc-protocol: Wire types for the local companion
//!
//! This crate defines the messages exchanged with the remote control plane
//! (JSON-RPC 2.0 over a WebSocket) and with local tools through the
//! loopback control API.

pub mod error;
pub mod jsonrpc;
pub mod local;
pub mod workspace;

pub use error::ProtocolError;
pub use jsonrpc::{Incoming, Notification, Request, RequestId, Response, RpcErrorObject};
pub use local::{ForwardStatus, LocalRequest, LocalResponse, SshConnection, TunnelStatus};
pub use workspace::{
    ExposedPortStatus, InstanceConditions, InstancePhase, InstanceStatus, Workspace,
    WorkspaceInfo, WorkspaceInstance,
};

/// Path suffix appended to the control-plane origin for the RPC endpoint
pub const API_PATH: &str = "/api/v1";

/// JSON-RPC method returning the scopes granted to a token
pub const METHOD_GET_TOKEN_SCOPES: &str = "getGitpodTokenScopes";

/// JSON-RPC method listing the user's workspaces
pub const METHOD_GET_WORKSPACES: &str = "getWorkspaces";

/// JSON-RPC method returning the owner token of a workspace
pub const METHOD_GET_OWNER_TOKEN: &str = "getOwnerToken";

/// Server-initiated notification carrying an instance update
pub const NOTIFY_INSTANCE_UPDATE: &str = "onInstanceUpdate";

/// JSON-RPC error code the control plane uses for forbidden calls
pub const CODE_FORBIDDEN: i64 = 403;
