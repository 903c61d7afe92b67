//! Local tunnel endpoints
//!
//! [`PortForwarder`] keeps one loopback listener per forwarded port of every
//! live tunnel. It is a lifecycle observer: listeners are opened on `added`
//! and `updated`, and closed on `removed` or when a resync no longer lists
//! the tunnel. All socket work happens in the observer dispatcher, never
//! under the orchestrator lock.
//!
//! Each accepted connection is carried to its target port inside the
//! instance by a [`TunnelDialer`]. [`SshDialer`] does that with SSH
//! `direct-tcpip` channels through the workspace SSH gateway.

mod ssh;

pub use ssh::{SshDialer, GATEWAY_PORT};

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lc_core::InstanceId;

use crate::observer::LifecycleObserver;
use crate::tunnel::{Snapshot, Tunnel};

/// Pause after a failed `accept` before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Byte stream to a port inside an instance
pub trait TunnelIo: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> TunnelIo for T {}

/// Boxed [`TunnelIo`]
pub type TunnelStream = Pin<Box<dyn TunnelIo>>;

/// Opens streams to ports inside instances
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    /// Open a stream to `target_port` of the tunnel's instance
    async fn dial(&self, tunnel: &Tunnel, target_port: u16) -> anyhow::Result<TunnelStream>;

    /// The instance's tunnel is gone; drop whatever is kept for it
    async fn release(&self, _instance_id: &InstanceId) {}
}

/// One listening local port
struct Endpoint {
    target: Arc<AtomicU16>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Endpoint {
    async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Endpoints of one instance
struct InstanceEndpoints {
    tunnel: Arc<RwLock<Tunnel>>,
    cancel: CancellationToken,
    ports: BTreeMap<u16, Endpoint>,
}

/// Opens and closes the local endpoints of live tunnels
pub struct PortForwarder {
    dialer: Arc<dyn TunnelDialer>,
    bind_addr: Ipv4Addr,
    instances: Mutex<HashMap<InstanceId, InstanceEndpoints>>,
}

impl PortForwarder {
    /// Forwarder binding on 127.0.0.1
    pub fn new(dialer: Arc<dyn TunnelDialer>) -> Self {
        Self {
            dialer,
            bind_addr: Ipv4Addr::LOCALHOST,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Local ports currently listening for an instance
    pub fn listening(&self, instance_id: &InstanceId) -> Vec<u16> {
        self.instances
            .lock()
            .get(instance_id)
            .map(|e| e.ports.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Bring the endpoints of `tunnel` in line with its forwards
    async fn sync(&self, tunnel: &Tunnel) -> anyhow::Result<()> {
        let id = tunnel.instance_id.clone();
        let wanted: BTreeMap<u16, u16> = tunnel
            .forwards
            .iter()
            .map(|p| (p.local_port, p.target_port))
            .collect();

        let (shared, parent, stale, missing) = {
            let mut instances = self.instances.lock();
            let entry = instances
                .entry(id.clone())
                .or_insert_with(|| InstanceEndpoints {
                    tunnel: Arc::new(RwLock::new(tunnel.clone())),
                    cancel: CancellationToken::new(),
                    ports: BTreeMap::new(),
                });
            *entry.tunnel.write() = tunnel.clone();

            let stale_ports: Vec<u16> = entry
                .ports
                .keys()
                .filter(|local| !wanted.contains_key(*local))
                .copied()
                .collect();
            let stale: Vec<Endpoint> = stale_ports
                .iter()
                .filter_map(|local| entry.ports.remove(local))
                .collect();

            let mut missing = Vec::new();
            for (local, target) in &wanted {
                match entry.ports.get(local) {
                    Some(endpoint) => endpoint.target.store(*target, Ordering::Relaxed),
                    None => missing.push((*local, *target)),
                }
            }
            (entry.tunnel.clone(), entry.cancel.clone(), stale, missing)
        };

        for endpoint in stale {
            endpoint.shutdown().await;
        }

        let mut failures = Vec::new();
        for (local, target) in missing {
            let listener = match TcpListener::bind((self.bind_addr, local)).await {
                Ok(listener) => listener,
                Err(e) => {
                    failures.push(format!("{}:{}: {}", self.bind_addr, local, e));
                    continue;
                }
            };
            tracing::info!(instance = %id, local, target, "Opened tunnel endpoint");

            let cancel = parent.child_token();
            let target = Arc::new(AtomicU16::new(target));
            let task = tokio::spawn(accept_loop(
                listener,
                target.clone(),
                shared.clone(),
                cancel.clone(),
                self.dialer.clone(),
            ));
            let endpoint = Endpoint {
                target,
                cancel,
                task,
            };

            let orphan = match self.instances.lock().get_mut(&id) {
                Some(entry) => entry.ports.insert(local, endpoint),
                None => Some(endpoint),
            };
            if let Some(orphan) = orphan {
                orphan.shutdown().await;
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Failed to open tunnel endpoints for {}: {}",
                id,
                failures.join(", ")
            )
        }
    }

    /// Close every endpoint of an instance and its open connections
    async fn close(&self, instance_id: &InstanceId) {
        let Some(entry) = self.instances.lock().remove(instance_id) else {
            return;
        };
        entry.cancel.cancel();
        let count = entry.ports.len();
        for (_, endpoint) in entry.ports {
            let _ = endpoint.task.await;
        }
        self.dialer.release(instance_id).await;
        tracing::info!(instance = %instance_id, endpoints = count, "Closed tunnel endpoints");
    }
}

#[async_trait]
impl LifecycleObserver for PortForwarder {
    fn name(&self) -> &str {
        "port-forwarder"
    }

    async fn added(&self, tunnel: &Tunnel, _snapshot: &Snapshot) -> anyhow::Result<()> {
        self.sync(tunnel).await
    }

    async fn updated(&self, tunnel: &Tunnel, _snapshot: &Snapshot) -> anyhow::Result<()> {
        self.sync(tunnel).await
    }

    async fn removed(&self, tunnel: &Tunnel, _snapshot: &Snapshot) -> anyhow::Result<()> {
        self.close(&tunnel.instance_id).await;
        Ok(())
    }

    async fn resynced(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let gone: Vec<InstanceId> = self
            .instances
            .lock()
            .keys()
            .filter(|id| snapshot.get(id).is_none())
            .cloned()
            .collect();
        for id in gone {
            self.close(&id).await;
        }
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    target: Arc<AtomicU16>,
    tunnel: Arc<RwLock<Tunnel>>,
    cancel: CancellationToken,
    dialer: Arc<dyn TunnelDialer>,
) {
    let local = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let tunnel = tunnel.read().clone();
                    let target = target.load(Ordering::Relaxed);
                    tokio::spawn(carry(stream, peer, tunnel, target, dialer.clone(), cancel.clone()));
                }
                Err(e) => {
                    tracing::warn!(local, "Failed to accept tunnel connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
    tracing::debug!(local, "Tunnel endpoint closed");
}

/// Shuttle bytes between a local connection and the instance
async fn carry(
    mut local: TcpStream,
    peer: SocketAddr,
    tunnel: Tunnel,
    target: u16,
    dialer: Arc<dyn TunnelDialer>,
    cancel: CancellationToken,
) {
    let dialed = tokio::select! {
        dialed = dialer.dial(&tunnel, target) => dialed,
        _ = cancel.cancelled() => return,
    };
    let mut remote = match dialed {
        Ok(remote) => remote,
        Err(e) => {
            tracing::warn!(
                instance = %tunnel.instance_id,
                target,
                "Failed to reach instance port: {:#}",
                e
            );
            return;
        }
    };

    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut local, &mut remote) => match copied {
            Ok((sent, received)) => {
                tracing::debug!(%peer, target, sent, received, "Tunnel connection finished");
            }
            Err(e) => tracing::debug!(%peer, target, "Tunnel connection failed: {}", e),
        },
        _ = cancel.cancelled() => {
            tracing::debug!(%peer, target, "Tunnel closed under an open connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lc_core::ExposedPort;
    use lc_protocol::WorkspaceInstance;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Dials plain TCP on 127.0.0.1 in place of the instance
    #[derive(Default)]
    struct LoopbackDialer {
        released: AtomicUsize,
    }

    #[async_trait]
    impl TunnelDialer for LoopbackDialer {
        async fn dial(&self, _tunnel: &Tunnel, target_port: u16) -> anyhow::Result<TunnelStream> {
            let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, target_port)).await?;
            Ok(Box::pin(stream))
        }

        async fn release(&self, _instance_id: &InstanceId) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn tunnel(forwards: &[(u16, u16)]) -> Tunnel {
        let inst: WorkspaceInstance = serde_json::from_value(serde_json::json!({
            "id": "i1",
            "workspaceId": "ws1",
            "status": {"phase": "running"}
        }))
        .unwrap();
        let ports = forwards
            .iter()
            .map(|(l, t)| (*l, ExposedPort::explicit(u32::from(*l), Some(u32::from(*t))).unwrap()))
            .collect();
        Tunnel::derive(&inst, &ports, "gitpod.example.com")
    }

    async fn roundtrip(port: u16, payload: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        stream.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_endpoint_carries_traffic() {
        let target = echo_server().await;
        let local = free_port().await;
        let forwarder = PortForwarder::new(Arc::new(LoopbackDialer::default()));

        forwarder
            .added(&tunnel(&[(local, target)]), &Snapshot::default())
            .await
            .unwrap();

        assert_eq!(forwarder.listening(&InstanceId::from("i1")), vec![local]);
        assert_eq!(roundtrip(local, b"hello").await, b"hello");
    }

    #[tokio::test]
    async fn test_removed_closes_endpoint() {
        let target = echo_server().await;
        let local = free_port().await;
        let dialer = Arc::new(LoopbackDialer::default());
        let forwarder = PortForwarder::new(dialer.clone());
        let t = tunnel(&[(local, target)]);

        forwarder.added(&t, &Snapshot::default()).await.unwrap();
        forwarder.removed(&t, &Snapshot::default()).await.unwrap();

        assert!(forwarder.listening(&t.instance_id).is_empty());
        assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, local)).await.is_err());
        assert_eq!(dialer.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_update_retargets_and_drops_ports() {
        let first = echo_server().await;
        let second = echo_server().await;
        let kept = free_port().await;
        let dropped = free_port().await;
        let forwarder = PortForwarder::new(Arc::new(LoopbackDialer::default()));

        forwarder
            .added(&tunnel(&[(kept, first), (dropped, first)]), &Snapshot::default())
            .await
            .unwrap();
        forwarder
            .updated(&tunnel(&[(kept, second)]), &Snapshot::default())
            .await
            .unwrap();

        assert_eq!(forwarder.listening(&InstanceId::from("i1")), vec![kept]);
        assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, dropped)).await.is_err());
        assert_eq!(roundtrip(kept, b"again").await, b"again");
    }

    #[tokio::test]
    async fn test_busy_port_reported() {
        let busy = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = busy.local_addr().unwrap().port();
        let forwarder = PortForwarder::new(Arc::new(LoopbackDialer::default()));

        let err = forwarder
            .added(&tunnel(&[(port, 80)]), &Snapshot::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains(&port.to_string()));
        assert!(forwarder.listening(&InstanceId::from("i1")).is_empty());
    }

    #[tokio::test]
    async fn test_resync_closes_unlisted_instances() {
        let local = free_port().await;
        let forwarder = PortForwarder::new(Arc::new(LoopbackDialer::default()));
        forwarder
            .added(&tunnel(&[(local, 80)]), &Snapshot::default())
            .await
            .unwrap();

        forwarder.resynced(&Snapshot::default()).await.unwrap();
        assert!(forwarder.listening(&InstanceId::from("i1")).is_empty());
    }
}
