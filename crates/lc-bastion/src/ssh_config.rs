//! SSH config writer
//!
//! Regenerates the whole SSH client config from the current snapshot on
//! every lifecycle event. The file is written to a temporary file in the
//! same directory and renamed over the target, so concurrent `ssh`
//! invocations see either the old or the new file, never a partial one.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;

use crate::observer::LifecycleObserver;
use crate::tunnel::{Snapshot, Tunnel};

const HEADER: &str = "# Generated by local-companion. Manual edits are overwritten.\n";

/// Render the host block of one tunnel
///
/// Forwarded ports are listed as comments: the companion itself listens on
/// them, so `ssh` must not try to bind them again.
pub fn render_block(tunnel: &Tunnel) -> String {
    let mut block = String::new();
    let alias = tunnel.host_alias();
    let _ = writeln!(block, "Host {}", alias);
    let _ = writeln!(block, "    HostName {}", tunnel.hostname);
    let _ = writeln!(block, "    User {}", alias);
    for port in &tunnel.forwards {
        let _ = writeln!(
            block,
            "    # forwarded by local-companion: 127.0.0.1:{} -> localhost:{}",
            port.local_port, port.target_port
        );
    }
    block
}

/// Render the full config for a snapshot
pub fn render_config(snapshot: &Snapshot) -> String {
    let mut out = String::from(HEADER);
    for tunnel in snapshot.tunnels() {
        out.push('\n');
        out.push_str(&render_block(tunnel));
    }
    out
}

/// Observer that keeps an SSH config file in sync with the tunnel set
#[derive(Debug, Clone)]
pub struct SshConfigWriter {
    path: PathBuf,
}

impl SshConfigWriter {
    /// Create a writer for the given file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the file with the rendering of `snapshot`
    pub async fn write(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let content = render_config(snapshot);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, content.as_bytes()))
            .await
            .context("SSH config writer task panicked")??;
        tracing::debug!(path = %self.path.display(), hosts = snapshot.len(), "Wrote SSH config");
        Ok(())
    }
}

fn write_atomic(path: &Path, content: &[u8]) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl LifecycleObserver for SshConfigWriter {
    fn name(&self) -> &str {
        "ssh-config"
    }

    async fn added(&self, _tunnel: &Tunnel, snapshot: &Snapshot) -> anyhow::Result<()> {
        self.write(snapshot).await
    }

    async fn updated(&self, _tunnel: &Tunnel, snapshot: &Snapshot) -> anyhow::Result<()> {
        self.write(snapshot).await
    }

    async fn removed(&self, _tunnel: &Tunnel, snapshot: &Snapshot) -> anyhow::Result<()> {
        self.write(snapshot).await
    }

    async fn resynced(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        self.write(snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lc_core::ExposedPort;
    use lc_protocol::WorkspaceInstance;
    use std::collections::BTreeMap;

    fn tunnel(id: &str, ws: &str, ports: &[(u32, u32)]) -> Tunnel {
        let inst: WorkspaceInstance = serde_json::from_value(serde_json::json!({
            "id": id,
            "workspaceId": ws,
            "ideUrl": format!("https://{}.ws-eu01.gitpod.io", ws),
            "status": {"phase": "running"}
        }))
        .unwrap();
        let mut map = BTreeMap::new();
        for &(local, target) in ports {
            let p = ExposedPort::explicit(local, Some(target)).unwrap();
            map.insert(p.local_port, p);
        }
        Tunnel::derive(&inst, &map, "gitpod.io")
    }

    #[test]
    fn test_render_block() {
        let block = render_block(&tunnel("i1", "amber-dog-1a2b3c4d", &[(8080, 80), (3000, 3000)]));
        assert_eq!(
            block,
            "Host amber-dog-1a2b3c4d\n\
             \x20   HostName amber-dog-1a2b3c4d.ssh.ws-eu01.gitpod.io\n\
             \x20   User amber-dog-1a2b3c4d\n\
             \x20   # forwarded by local-companion: 127.0.0.1:3000 -> localhost:3000\n\
             \x20   # forwarded by local-companion: 127.0.0.1:8080 -> localhost:80\n"
        );
    }

    #[test]
    fn test_empty_snapshot_has_no_hosts() {
        let config = render_config(&Snapshot::default());
        assert_eq!(config, HEADER);
        assert!(!config.contains("Host "));
    }

    #[test]
    fn test_removal_leaves_other_blocks_identical() {
        let a = tunnel("i1", "alpha", &[(22, 22)]);
        let b = tunnel("i2", "beta", &[(8080, 8080)]);
        let c = tunnel("i3", "gamma", &[]);

        let before = render_config(&Snapshot::new(vec![a.clone(), b.clone(), c.clone()]));
        let after = render_config(&Snapshot::new(vec![a.clone(), c.clone()]));

        let block_b = render_block(&b);
        assert!(before.contains(&block_b));
        assert!(!after.contains(&block_b));
        assert_eq!(before.replacen(&format!("\n{}", block_b), "", 1), after);
    }

    #[tokio::test]
    async fn test_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ssh_config");
        let writer = SshConfigWriter::new(&path);

        writer
            .write(&Snapshot::new(vec![tunnel("i1", "alpha", &[(22, 22)])]))
            .await
            .unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("Host alpha"));

        writer.write(&Snapshot::default()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), HEADER);

        // No temp files left behind
        let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
