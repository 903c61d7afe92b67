//! lc-core: Core abstractions and configuration for the local companion
//!
//! This crate provides the shared domain types, the error taxonomy, the
//! process configuration, and the traits that separate the connection
//! supervisor and tunnel orchestrator from their external collaborators
//! (credential store, login flow, control-plane transport).

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::CompanionConfig;
pub use error::{ConfigError, CredentialError, ExposeError, LoginError, SessionError};
pub use traits::{
    CloseReason, Connector, ControlPlane, CredentialStore, InstanceUpdates, LoginFlow,
    ReconnectHandler,
};
pub use types::{ExposedPort, InstanceId, Origin, PortSource, WorkspaceId};

/// Scopes a credential must carry to be usable by the companion
pub const REQUIRED_SCOPES: &[&str] = &[
    "function:getWorkspace",
    "function:getWorkspaces",
    "function:listenForWorkspaceInstanceUpdates",
    "resource:default",
];
