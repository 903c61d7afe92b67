//! Tunnel model
//!
//! A [`Tunnel`] is derived from a tracked instance and its exposed ports and
//! nothing else; two derivations from the same inputs are equal. The SSH
//! config writer and the local API only ever see tunnels through a
//! [`Snapshot`].

use std::collections::BTreeMap;
use std::sync::Arc;

use lc_core::{ExposedPort, InstanceId, WorkspaceId};
use lc_protocol::{ForwardStatus, InstancePhase, TunnelStatus, WorkspaceInstance};

/// Materialized SSH tunnel entry for one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    /// Instance the tunnel points at
    pub instance_id: InstanceId,
    /// Workspace owning the instance; also the SSH host alias
    pub workspace_id: WorkspaceId,
    /// SSH host name of the instance
    pub hostname: String,
    /// Last observed phase
    pub phase: InstancePhase,
    /// The pod is being deleted but the instance is still tracked
    pub pod_deletion_in_progress: bool,
    /// Forwarded ports, ascending by local port
    pub forwards: Vec<ExposedPort>,
}

impl Tunnel {
    /// Derive the tunnel for an instance
    ///
    /// `ports` holds the effective ports keyed by local port; `origin_host`
    /// is used when the instance has no IDE URL yet.
    pub fn derive(
        instance: &WorkspaceInstance,
        ports: &BTreeMap<u16, ExposedPort>,
        origin_host: &str,
    ) -> Self {
        Self {
            instance_id: InstanceId::new(instance.id.clone()),
            workspace_id: WorkspaceId::new(instance.workspace_id.clone()),
            hostname: ssh_hostname(&instance.workspace_id, instance.ide_url.as_deref(), origin_host),
            phase: instance.status.phase,
            pod_deletion_in_progress: instance.status.conditions.pod_deletion_in_progress,
            forwards: ports.values().copied().collect(),
        }
    }

    /// SSH host alias used in the generated config
    pub fn host_alias(&self) -> &str {
        self.workspace_id.as_str()
    }

    /// Wire representation for the local API
    pub fn status(&self) -> TunnelStatus {
        TunnelStatus {
            instance_id: self.instance_id.to_string(),
            workspace_id: self.workspace_id.to_string(),
            host: self.host_alias().to_string(),
            phase: self.phase.to_string(),
            forwards: self
                .forwards
                .iter()
                .map(|p| ForwardStatus {
                    local_port: p.local_port,
                    target_port: p.target_port,
                    explicit: p.is_explicit(),
                })
                .collect(),
        }
    }
}

/// `<workspaceId>.ssh.<cluster host>`
///
/// The cluster host is the IDE URL host with its first label (the
/// workspace id) removed. Without an IDE URL the origin host is used.
fn ssh_hostname(workspace_id: &str, ide_url: Option<&str>, origin_host: &str) -> String {
    let cluster = ide_url
        .and_then(|raw| url::Url::parse(raw).ok())
        .and_then(|u| u.host_str().map(str::to_string))
        .and_then(|host| host.split_once('.').map(|(_, rest)| rest.to_string()))
        .filter(|rest| !rest.is_empty())
        .unwrap_or_else(|| origin_host.to_string());
    format!("{}.ssh.{}", workspace_id, cluster)
}

/// Point-in-time view of every tunnel, sorted by workspace id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    tunnels: Arc<Vec<Tunnel>>,
}

impl Snapshot {
    /// Build a snapshot from tunnels in any order
    pub fn new(mut tunnels: Vec<Tunnel>) -> Self {
        tunnels.sort_by(|a, b| {
            a.workspace_id
                .cmp(&b.workspace_id)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Self {
            tunnels: Arc::new(tunnels),
        }
    }

    /// Tunnels in workspace id order
    pub fn tunnels(&self) -> &[Tunnel] {
        &self.tunnels
    }

    /// Tunnel of one instance
    pub fn get(&self, instance_id: &InstanceId) -> Option<&Tunnel> {
        self.tunnels.iter().find(|t| &t.instance_id == instance_id)
    }

    /// Number of tunnels
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    /// Whether there are no tunnels
    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lc_protocol::InstanceStatus;

    fn instance(id: &str, ws: &str, ide_url: Option<&str>) -> WorkspaceInstance {
        WorkspaceInstance {
            id: id.to_string(),
            workspace_id: ws.to_string(),
            ide_url: ide_url.map(str::to_string),
            status: InstanceStatus {
                phase: InstancePhase::Running,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_hostname_from_ide_url() {
        let inst = instance(
            "i1",
            "amber-dog-1a2b3c4d",
            Some("https://amber-dog-1a2b3c4d.ws-eu01.gitpod.io"),
        );
        let tunnel = Tunnel::derive(&inst, &BTreeMap::new(), "gitpod.io");
        assert_eq!(tunnel.hostname, "amber-dog-1a2b3c4d.ssh.ws-eu01.gitpod.io");
        assert_eq!(tunnel.host_alias(), "amber-dog-1a2b3c4d");
    }

    #[test]
    fn test_hostname_falls_back_to_origin() {
        let inst = instance("i1", "ws1", None);
        let tunnel = Tunnel::derive(&inst, &BTreeMap::new(), "gitpod.example.com");
        assert_eq!(tunnel.hostname, "ws1.ssh.gitpod.example.com");

        let inst = instance("i1", "ws1", Some("not a url"));
        let tunnel = Tunnel::derive(&inst, &BTreeMap::new(), "gitpod.example.com");
        assert_eq!(tunnel.hostname, "ws1.ssh.gitpod.example.com");
    }

    #[test]
    fn test_forwards_follow_port_order() {
        let mut ports = BTreeMap::new();
        for p in [9000u16, 3000, 8080] {
            ports.insert(p, ExposedPort::discovered(p).unwrap());
        }
        let tunnel = Tunnel::derive(&instance("i", "w", None), &ports, "h");
        let locals: Vec<u16> = tunnel.forwards.iter().map(|p| p.local_port).collect();
        assert_eq!(locals, vec![3000, 8080, 9000]);
    }

    #[test]
    fn test_derive_is_deterministic() {
        let inst = instance("i", "w", Some("https://w.ws.example.com"));
        let mut ports = BTreeMap::new();
        ports.insert(22, ExposedPort::explicit(22, Some(2222)).unwrap());
        assert_eq!(
            Tunnel::derive(&inst, &ports, "h"),
            Tunnel::derive(&inst, &ports, "h")
        );
    }

    #[test]
    fn test_snapshot_sorted_by_workspace() {
        let t = |i: &str, w: &str| Tunnel::derive(&instance(i, w, None), &BTreeMap::new(), "h");
        let snap = Snapshot::new(vec![t("i2", "zeta"), t("i1", "alpha")]);
        let ids: Vec<&str> = snap.tunnels().iter().map(|t| t.host_alias()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
        assert!(snap.get(&InstanceId::from("i2")).is_some());
    }

    #[test]
    fn test_status_wire_form() {
        let mut ports = BTreeMap::new();
        ports.insert(8080, ExposedPort::explicit(8080, Some(80)).unwrap());
        let status = Tunnel::derive(&instance("i", "w", None), &ports, "h").status();
        assert_eq!(status.phase, "running");
        assert_eq!(status.forwards[0].target_port, 80);
        assert!(status.forwards[0].explicit);
    }
}
