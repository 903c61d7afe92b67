//! Core trait definitions

mod control_plane;
mod credentials;

pub use control_plane::{CloseReason, Connector, ControlPlane, InstanceUpdates, ReconnectHandler};
pub use credentials::{CredentialStore, LoginFlow};
