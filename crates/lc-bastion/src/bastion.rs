//! Tunnel orchestrator
//!
//! The [`Bastion`] owns the tracked instance set, the exposed ports of each
//! instance and the tunnels derived from them. Every mutation (instance
//! update, expose request, full resync, pending cleanup) happens under one
//! lock; the lock is never held across I/O.
//!
//! Observer notifications are queued while the lock is held, so their order
//! matches commit order, and delivered afterwards by a dispatcher task. A
//! slow observer delays later notifications but never a mutation.
//!
//! # Instance lifecycle
//!
//! ```text
//! Unknown ──update──▶ Tracked ──update──▶ Tracked ──stopped / absent from resync──▶ Removed
//! ```
//!
//! Pod deletion in progress is kept as metadata; the tunnel stays until the
//! instance is actually removed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;

use lc_core::{
    CompanionConfig, ControlPlane, ExposeError, ExposedPort, InstanceId, InstanceUpdates, Origin,
};
use lc_protocol::WorkspaceInstance;

use crate::observer::{EventKind, LifecycleEvent, ObserverSet};
use crate::tunnel::{Snapshot, Tunnel};

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct BastionConfig {
    /// Origin host, used for SSH host names of instances without an IDE URL
    pub origin_host: String,
    /// Forward remote-exposed ports unless overridden per instance
    pub auto_tunnel: bool,
    /// Lifetime of an expose request for an instance that is not tracked yet
    pub pending_expose_ttl: Duration,
    /// Per-attempt deadline of liveness checks
    pub liveness_timeout: Duration,
    /// Liveness check attempts
    pub liveness_attempts: u32,
}

impl BastionConfig {
    /// Settings from the process configuration
    pub fn from_companion(config: &CompanionConfig, origin: &Origin) -> Self {
        Self {
            origin_host: origin.hostname().to_string(),
            auto_tunnel: config.auto_tunnel,
            pending_expose_ttl: config.pending_expose_ttl,
            liveness_timeout: config.liveness_timeout,
            liveness_attempts: config.liveness_attempts.max(1),
        }
    }
}

/// Result of an expose request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposeOutcome {
    /// Applied to a tracked instance
    Applied,
    /// Buffered until the instance shows up
    Pending,
}

/// Counts reported after a full resync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncSummary {
    /// Instances reported live by the control plane
    pub instances: usize,
    /// Tunnels after applying the resync
    pub tunnels: usize,
}

struct TrackedInstance {
    instance: WorkspaceInstance,
    explicit: BTreeMap<u16, ExposedPort>,
    auto_tunnel: Option<bool>,
}

impl TrackedInstance {
    fn new(instance: WorkspaceInstance) -> Self {
        Self {
            instance,
            explicit: BTreeMap::new(),
            auto_tunnel: None,
        }
    }

    /// Discovered ports from the latest metadata, overlaid by explicit ones
    fn effective_ports(&self, auto_default: bool) -> BTreeMap<u16, ExposedPort> {
        let mut ports = BTreeMap::new();
        if self.auto_tunnel.unwrap_or(auto_default) {
            for status in &self.instance.status.exposed_ports {
                if let Some(port) = ExposedPort::discovered(status.port) {
                    ports.insert(port.local_port, port);
                }
            }
        }
        for (local, port) in &self.explicit {
            ports.insert(*local, *port);
        }
        ports
    }
}

struct PendingExpose {
    port: ExposedPort,
    requested_at: Instant,
}

/// Liveness checks in flight for one instance id
///
/// `superseded` is set when newer information about the instance (an
/// update, a removal or a full resync) is applied while a check runs; the
/// check's result is then stale and must not be applied.
#[derive(Default)]
struct LivenessCheck {
    waiters: usize,
    superseded: bool,
}

#[derive(Default)]
struct State {
    instances: BTreeMap<InstanceId, TrackedInstance>,
    tunnels: BTreeMap<InstanceId, Tunnel>,
    pending: HashMap<InstanceId, Vec<PendingExpose>>,
    checks: HashMap<InstanceId, LivenessCheck>,
}

impl State {
    fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.tunnels.values().cloned().collect())
    }

    fn supersede_check(&mut self, id: &InstanceId) {
        if let Some(check) = self.checks.get_mut(id) {
            check.superseded = true;
        }
    }

    /// Register a liveness check for `id`
    fn begin_check(&mut self, id: &InstanceId) {
        self.checks.entry(id.clone()).or_default().waiters += 1;
    }

    /// Unregister a liveness check; true if its result is still current
    fn end_check(&mut self, id: &InstanceId) -> bool {
        let Some(check) = self.checks.get_mut(id) else {
            return false;
        };
        let current = !check.superseded;
        check.waiters -= 1;
        if check.waiters == 0 {
            self.checks.remove(id);
        }
        current
    }
}

/// The control-plane session currently attached, shared with collaborators
/// that need it outside the orchestrator (the SSH dialer asks it for owner
/// tokens)
#[derive(Clone, Default)]
pub struct SourceSlot {
    inner: Arc<RwLock<Option<Arc<dyn ControlPlane>>>>,
}

impl SourceSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// The attached session, if any
    pub fn get(&self) -> Option<Arc<dyn ControlPlane>> {
        self.inner.read().clone()
    }

    fn set(&self, source: Option<Arc<dyn ControlPlane>>) {
        *self.inner.write() = source;
    }
}

enum DispatchMsg {
    Event(LifecycleEvent),
    Barrier(oneshot::Sender<()>),
}

/// The tunnel orchestrator
pub struct Bastion {
    config: BastionConfig,
    state: Mutex<State>,
    source: SourceSlot,
    events: mpsc::UnboundedSender<DispatchMsg>,
    resync_requested: Notify,
}

impl Bastion {
    /// Create the orchestrator and start its observer dispatcher
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: BastionConfig, observers: ObserverSet) -> Arc<Self> {
        Self::with_source(config, observers, SourceSlot::new())
    }

    /// Like [`Bastion::new`], publishing the attached session through `source`
    pub fn with_source(config: BastionConfig, observers: ObserverSet, source: SourceSlot) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatcher(observers, rx));

        Arc::new(Self {
            config,
            state: Mutex::new(State::default()),
            source,
            events,
            resync_requested: Notify::new(),
        })
    }

    /// Orchestrator settings
    pub fn config(&self) -> &BastionConfig {
        &self.config
    }

    /// Use `source` for resyncs and liveness checks
    pub fn attach(&self, source: Arc<dyn ControlPlane>) {
        self.source.set(Some(source));
    }

    /// Forget the current source; tracked state is kept until the next resync
    pub fn detach(&self) {
        self.source.set(None);
    }

    fn source(&self) -> Option<Arc<dyn ControlPlane>> {
        self.source.get()
    }

    /// Ask the serve loop for a full resync
    pub fn request_resync(&self) {
        self.resync_requested.notify_one();
    }

    /// Apply instance updates until the stream ends
    ///
    /// Resync requests are handled in between updates.
    pub async fn serve(&self, mut updates: InstanceUpdates) {
        loop {
            tokio::select! {
                update = updates.next() => match update {
                    Some(instance) => self.apply_update(instance),
                    None => {
                        tracing::debug!("Instance update stream ended");
                        break;
                    }
                },
                _ = self.resync_requested.notified() => {
                    if let Err(e) = self.resync().await {
                        tracing::warn!("Resync failed: {}", e);
                    }
                }
            }
        }
    }

    /// Apply a single instance update
    pub fn apply_update(&self, instance: WorkspaceInstance) {
        let mut state = self.state.lock();
        self.prune_pending_locked(&mut state, Instant::now());
        self.apply_locked(&mut state, instance);
    }

    /// Re-fetch the authoritative instance list and reconcile
    pub async fn resync(&self) -> Result<ResyncSummary, ExposeError> {
        let source = self.source().ok_or(ExposeError::NotConnected)?;
        let instances = source
            .list_instances()
            .await
            .map_err(|e| ExposeError::RefreshFailed(e.to_string()))?;
        Ok(self.apply_resync(instances))
    }

    /// Reconcile tracked state against a full instance list
    pub fn apply_resync(&self, instances: Vec<WorkspaceInstance>) -> ResyncSummary {
        let mut state = self.state.lock();
        self.prune_pending_locked(&mut state, Instant::now());
        for check in state.checks.values_mut() {
            check.superseded = true;
        }

        let live: Vec<WorkspaceInstance> = instances
            .into_iter()
            .filter(|i| !i.status.phase.is_terminal())
            .collect();
        let live_ids: BTreeSet<InstanceId> =
            live.iter().map(|i| InstanceId::new(i.id.clone())).collect();

        let gone: Vec<InstanceId> = state
            .instances
            .keys()
            .filter(|id| !live_ids.contains(*id))
            .cloned()
            .collect();
        for id in &gone {
            self.remove_locked(&mut state, id);
        }

        let count = live_ids.len();
        for instance in live {
            self.apply_locked(&mut state, instance);
        }

        let summary = ResyncSummary {
            instances: count,
            tunnels: state.tunnels.len(),
        };
        self.emit(LifecycleEvent::Resynced {
            snapshot: state.snapshot(),
        });
        tracing::debug!(
            instances = summary.instances,
            removed = gone.len(),
            tunnels = summary.tunnels,
            "Applied resync"
        );
        summary
    }

    /// Expose `port` (forwarded to `target`, default `port`) for an instance
    ///
    /// If the instance is not tracked, the control plane is asked whether it
    /// exists. The answer is only applied if nothing newer about the instance
    /// arrived while waiting for it. Requests for instances that are still
    /// unknown afterwards are kept until the instance appears, is removed, or
    /// the request expires.
    pub async fn expose(
        &self,
        instance_id: &str,
        port: u32,
        target: Option<u32>,
    ) -> Result<ExposeOutcome, ExposeError> {
        let id = InstanceId::parse(instance_id)?;
        let port = ExposedPort::explicit(port, target)?;

        {
            let mut state = self.state.lock();
            if state.instances.contains_key(&id) {
                return Ok(self.expose_locked(&mut state, &id, port));
            }
            state.begin_check(&id);
        }

        let found = match self.source() {
            Some(source) => self.check_liveness(source.as_ref(), &id).await,
            None => None,
        };

        let mut state = self.state.lock();
        let current = state.end_check(&id);
        if let Some(instance) = found {
            if current && !state.instances.contains_key(&id) {
                self.prune_pending_locked(&mut state, Instant::now());
                self.apply_locked(&mut state, instance);
            } else {
                tracing::debug!(instance = %id, "Discarding outdated liveness result");
            }
        }
        Ok(self.expose_locked(&mut state, &id, port))
    }

    /// Enable or disable auto-tunneling for one tracked instance
    pub fn set_auto_tunnel(&self, instance_id: &str, enabled: bool) -> Result<(), ExposeError> {
        let id = InstanceId::parse(instance_id)?;
        let mut state = self.state.lock();
        let tracked = state
            .instances
            .get_mut(&id)
            .ok_or_else(|| ExposeError::UnknownInstance(id.to_string()))?;
        tracked.auto_tunnel = Some(enabled);
        let tunnel = self.recompute_locked(&mut state, &id);
        if let Some(tunnel) = tunnel {
            self.emit_tunnel(&state, EventKind::Updated, tunnel);
        }
        Ok(())
    }

    /// Current tunnels
    pub fn snapshot(&self) -> Snapshot {
        self.state.lock().snapshot()
    }

    /// Tunnel of one instance
    pub fn tunnel(&self, instance_id: &InstanceId) -> Option<Tunnel> {
        self.state.lock().tunnels.get(instance_id).cloned()
    }

    /// Number of buffered expose requests
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.values().map(Vec::len).sum()
    }

    /// Drop buffered expose requests older than the configured TTL
    pub fn prune_expired_pending(&self) -> usize {
        let mut state = self.state.lock();
        self.prune_pending_locked(&mut state, Instant::now())
    }

    /// Wait until every notification queued so far has been delivered
    pub async fn settled(&self) {
        let (tx, rx) = oneshot::channel();
        if self.events.send(DispatchMsg::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    async fn check_liveness(
        &self,
        source: &dyn ControlPlane,
        id: &InstanceId,
    ) -> Option<WorkspaceInstance> {
        for attempt in 1..=self.config.liveness_attempts {
            match tokio::time::timeout(self.config.liveness_timeout, source.list_instances()).await
            {
                Ok(Ok(instances)) => {
                    return instances
                        .into_iter()
                        .find(|i| i.id == id.as_str() && !i.status.phase.is_terminal());
                }
                Ok(Err(e)) => {
                    tracing::debug!(instance = %id, attempt, "Liveness check failed: {}", e);
                }
                Err(_) => {
                    tracing::debug!(instance = %id, attempt, "Liveness check timed out");
                }
            }
        }
        tracing::warn!(
            instance = %id,
            attempts = self.config.liveness_attempts,
            "Giving up on liveness check"
        );
        None
    }

    fn apply_locked(&self, state: &mut State, instance: WorkspaceInstance) {
        let id = InstanceId::new(instance.id.clone());
        state.supersede_check(&id);

        if instance.status.phase.is_terminal() {
            self.remove_locked(state, &id);
            return;
        }

        let kind = match state.instances.get_mut(&id) {
            Some(tracked) => {
                tracked.instance = instance;
                EventKind::Updated
            }
            None => {
                // A workspace runs at most one instance; a new one replaces
                // any older instance whose stop was missed
                let replaced: Vec<InstanceId> = state
                    .instances
                    .iter()
                    .filter(|(_, t)| t.instance.workspace_id == instance.workspace_id)
                    .map(|(other, _)| other.clone())
                    .collect();
                for other in &replaced {
                    tracing::info!(
                        workspace = %instance.workspace_id,
                        old = %other,
                        new = %id,
                        "Instance replaced by a newer one"
                    );
                    self.remove_locked(state, other);
                }

                let mut tracked = TrackedInstance::new(instance);
                if let Some(buffered) = state.pending.remove(&id) {
                    for request in buffered {
                        tracked.explicit.insert(request.port.local_port, request.port);
                    }
                    tracing::debug!(instance = %id, ports = tracked.explicit.len(), "Applied buffered expose requests");
                }
                state.instances.insert(id.clone(), tracked);
                EventKind::Added
            }
        };

        if let Some(tunnel) = self.recompute_locked(state, &id) {
            self.emit_tunnel(state, kind, tunnel);
        }
    }

    fn expose_locked(&self, state: &mut State, id: &InstanceId, port: ExposedPort) -> ExposeOutcome {
        match state.instances.get_mut(id) {
            Some(tracked) => {
                tracked.explicit.insert(port.local_port, port);
                if let Some(tunnel) = self.recompute_locked(state, id) {
                    self.emit_tunnel(state, EventKind::Updated, tunnel);
                }
                tracing::info!(
                    instance = %id,
                    local = port.local_port,
                    target = port.target_port,
                    "Exposed port"
                );
                ExposeOutcome::Applied
            }
            None => {
                let buffered = state.pending.entry(id.clone()).or_default();
                buffered.retain(|p| p.port.local_port != port.local_port);
                buffered.push(PendingExpose {
                    port,
                    requested_at: Instant::now(),
                });
                tracing::info!(
                    instance = %id,
                    local = port.local_port,
                    "Instance not tracked yet, expose request buffered"
                );
                ExposeOutcome::Pending
            }
        }
    }

    fn remove_locked(&self, state: &mut State, id: &InstanceId) {
        state.supersede_check(id);
        let dropped = state.pending.remove(id).map(|p| p.len()).unwrap_or(0);
        if dropped > 0 {
            tracing::debug!(instance = %id, dropped, "Dropped buffered expose requests");
        }
        if state.instances.remove(id).is_none() {
            return;
        }
        if let Some(tunnel) = state.tunnels.remove(id) {
            self.emit_tunnel(state, EventKind::Removed, tunnel);
        }
    }

    fn recompute_locked(&self, state: &mut State, id: &InstanceId) -> Option<Tunnel> {
        let tracked = state.instances.get(id)?;
        let ports = tracked.effective_ports(self.config.auto_tunnel);
        let tunnel = Tunnel::derive(&tracked.instance, &ports, &self.config.origin_host);
        state.tunnels.insert(id.clone(), tunnel.clone());
        Some(tunnel)
    }

    fn prune_pending_locked(&self, state: &mut State, now: Instant) -> usize {
        let ttl = self.config.pending_expose_ttl;
        let mut pruned = 0;
        state.pending.retain(|id, requests| {
            let before = requests.len();
            requests.retain(|r| now.duration_since(r.requested_at) < ttl);
            let expired = before - requests.len();
            if expired > 0 {
                tracing::debug!(instance = %id, expired, "Expired buffered expose requests");
            }
            pruned += expired;
            !requests.is_empty()
        });
        pruned
    }

    fn emit_tunnel(&self, state: &State, kind: EventKind, tunnel: Tunnel) {
        self.emit(LifecycleEvent::Tunnel {
            kind,
            tunnel,
            snapshot: state.snapshot(),
        });
    }

    fn emit(&self, event: LifecycleEvent) {
        if self.events.send(DispatchMsg::Event(event)).is_err() {
            tracing::warn!("Observer dispatcher is gone, dropping lifecycle event");
        }
    }
}

async fn run_dispatcher(observers: ObserverSet, mut rx: mpsc::UnboundedReceiver<DispatchMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            DispatchMsg::Event(event) => observers.dispatch(&event).await,
            DispatchMsg::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}
