//! lc-session: Control-plane connectivity for the local companion
//!
//! - [`client`]: JSON-RPC session over WebSocket with transparent reconnect
//! - [`supervisor`]: credential lifecycle and session hand-off to the bastion
//! - [`credentials`]: keyring and in-memory credential stores
//! - [`login`]: browser login with PKCE

pub mod backoff;
pub mod client;
pub mod credentials;
pub mod login;
pub mod supervisor;

pub use backoff::ExponentialBackoff;
pub use client::{token_hash, ClientConfig, RemoteSession, WsConnector};
pub use credentials::{KeyringStore, MemoryCredentialStore};
pub use login::BrowserLogin;
pub use supervisor::{Supervisor, SupervisorError};
