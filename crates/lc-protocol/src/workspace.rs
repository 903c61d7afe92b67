//! Workspace and instance payloads returned by the control plane
//!
//! Field names follow the control plane's camelCase JSON. Unknown fields
//! are ignored so newer servers stay compatible.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of a workspace instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstancePhase {
    /// Waiting for resources
    Preparing,
    /// Image build in progress
    Building,
    /// Scheduled, waiting for a node
    Pending,
    /// Container being created
    Creating,
    /// Content initialization running
    Initializing,
    /// Ready to serve
    Running,
    /// Temporarily unreachable
    Interrupted,
    /// Shutting down
    Stopping,
    /// Gone
    Stopped,
    /// Phase not reported (or not understood)
    #[default]
    #[serde(other)]
    Unknown,
}

impl InstancePhase {
    /// Whether an instance in this phase is gone for good
    pub fn is_terminal(self) -> bool {
        matches!(self, InstancePhase::Stopped)
    }
}

impl fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstancePhase::Unknown => "unknown",
            InstancePhase::Preparing => "preparing",
            InstancePhase::Building => "building",
            InstancePhase::Pending => "pending",
            InstancePhase::Creating => "creating",
            InstancePhase::Initializing => "initializing",
            InstancePhase::Running => "running",
            InstancePhase::Interrupted => "interrupted",
            InstancePhase::Stopping => "stopping",
            InstancePhase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Port the remote reports as exposed on the instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposedPortStatus {
    /// Port inside the workspace
    pub port: u16,
    /// Public URL, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Visibility ("private" / "public")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
}

/// Conditions attached to an instance status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConditions {
    /// The pod backing this instance is being deleted
    #[serde(default)]
    pub pod_deletion_in_progress: bool,
}

/// Instance status block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: InstancePhase,
    /// Conditions
    #[serde(default)]
    pub conditions: InstanceConditions,
    /// Ports the remote reports as exposed
    #[serde(default)]
    pub exposed_ports: Vec<ExposedPortStatus>,
}

/// A running (or transitioning) workspace instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInstance {
    /// Instance identifier
    pub id: String,
    /// Owning workspace identifier
    pub workspace_id: String,
    /// IDE URL (`https://<workspaceId>.<cluster host>`), present once scheduled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ide_url: Option<String>,
    /// Status block
    #[serde(default)]
    pub status: InstanceStatus,
}

/// Workspace metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    /// Workspace identifier
    pub id: String,
    /// Context the workspace was created from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_url: Option<String>,
    /// Owner identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

/// Workspace together with its most recent instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    /// Workspace metadata
    pub workspace: Workspace,
    /// Most recent instance, if the workspace ever started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_instance: Option<WorkspaceInstance>,
}
