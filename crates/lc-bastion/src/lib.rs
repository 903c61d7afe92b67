//! lc-bastion: Tunnel orchestration for the local companion
//!
//! This crate turns the instance updates of a control-plane session into
//! local tunnel state:
//! - [`Bastion`] tracks instances, exposed ports and tunnels
//! - [`observer`] fans lifecycle events out to registered observers
//! - [`PortForwarder`] opens the local endpoint of every forwarded port
//! - [`SshConfigWriter`] keeps an SSH client config in sync
//! - [`api`] serves the loopback control API behind an origin gate

pub mod api;
pub mod bastion;
pub mod cleanup;
pub mod forward;
pub mod observer;
pub mod ssh_config;
pub mod tunnel;

pub use api::{ApiServer, ApiState, OriginGate};
pub use bastion::{Bastion, BastionConfig, ExposeOutcome, ResyncSummary, SourceSlot};
pub use forward::{PortForwarder, SshDialer, TunnelDialer};
pub use observer::{LifecycleObserver, LogObserver, ObserverSet};
pub use ssh_config::SshConfigWriter;
pub use tunnel::{Snapshot, Tunnel};
