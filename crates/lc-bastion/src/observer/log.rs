//! Observer that logs every lifecycle event

use async_trait::async_trait;

use super::LifecycleObserver;
use crate::tunnel::{Snapshot, Tunnel};

/// Logs tunnel lifecycle events at info level
#[derive(Debug, Default)]
pub struct LogObserver;

impl LogObserver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LifecycleObserver for LogObserver {
    fn name(&self) -> &str {
        "log"
    }

    async fn added(&self, tunnel: &Tunnel, snapshot: &Snapshot) -> anyhow::Result<()> {
        tracing::info!(
            instance = %tunnel.instance_id,
            workspace = %tunnel.workspace_id,
            phase = %tunnel.phase,
            ports = tunnel.forwards.len(),
            total = snapshot.len(),
            "Tunnel added"
        );
        Ok(())
    }

    async fn updated(&self, tunnel: &Tunnel, _snapshot: &Snapshot) -> anyhow::Result<()> {
        tracing::debug!(
            instance = %tunnel.instance_id,
            phase = %tunnel.phase,
            pod_deletion = tunnel.pod_deletion_in_progress,
            ports = tunnel.forwards.len(),
            "Tunnel updated"
        );
        Ok(())
    }

    async fn removed(&self, tunnel: &Tunnel, snapshot: &Snapshot) -> anyhow::Result<()> {
        tracing::info!(
            instance = %tunnel.instance_id,
            workspace = %tunnel.workspace_id,
            total = snapshot.len(),
            "Tunnel removed"
        );
        Ok(())
    }

    async fn resynced(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        tracing::info!(tunnels = snapshot.len(), "Resync complete");
        Ok(())
    }
}
