//! Lifecycle observers
//!
//! Observers are told about every tunnel that is added, updated or removed,
//! plus every completed full resync. Each call carries the snapshot taken
//! when the change was committed, so observers never read orchestrator
//! state directly.
//!
//! Notifications are delivered in commit order by a single dispatcher task.
//! A failing observer is logged and skipped; the others still run.

mod log;

pub use self::log::LogObserver;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::tunnel::{Snapshot, Tunnel};

/// Handler for tunnel lifecycle events
#[async_trait]
pub trait LifecycleObserver: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// A tunnel appeared
    async fn added(&self, tunnel: &Tunnel, snapshot: &Snapshot) -> anyhow::Result<()>;

    /// A tunnel changed (phase, metadata or ports)
    async fn updated(&self, tunnel: &Tunnel, snapshot: &Snapshot) -> anyhow::Result<()>;

    /// A tunnel went away
    async fn removed(&self, tunnel: &Tunnel, snapshot: &Snapshot) -> anyhow::Result<()>;

    /// A full resync finished
    async fn resynced(&self, _snapshot: &Snapshot) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What happened to a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Updated,
    Removed,
}

/// A committed change, queued for observers
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// Single tunnel change
    Tunnel {
        kind: EventKind,
        tunnel: Tunnel,
        snapshot: Snapshot,
    },
    /// Full resync completed
    Resynced { snapshot: Snapshot },
}

/// Errors from observer registration
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ObserverError {
    /// The same observer instance is already registered
    #[error("Observer {0} is already registered")]
    Duplicate(String),
}

/// Ordered set of observers; insertion order is call order
#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn LifecycleObserver>>,
}

impl ObserverSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer; the same instance cannot be added twice
    pub fn register(&mut self, observer: Arc<dyn LifecycleObserver>) -> Result<(), ObserverError> {
        let ptr = Arc::as_ptr(&observer) as *const ();
        if self
            .observers
            .iter()
            .any(|o| Arc::as_ptr(o) as *const () == ptr)
        {
            return Err(ObserverError::Duplicate(observer.name().to_string()));
        }
        self.observers.push(observer);
        Ok(())
    }

    /// Number of registered observers
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether no observer is registered
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Deliver one event to every observer in order
    pub async fn dispatch(&self, event: &LifecycleEvent) {
        for observer in &self.observers {
            let result = match event {
                LifecycleEvent::Tunnel {
                    kind,
                    tunnel,
                    snapshot,
                } => match kind {
                    EventKind::Added => observer.added(tunnel, snapshot).await,
                    EventKind::Updated => observer.updated(tunnel, snapshot).await,
                    EventKind::Removed => observer.removed(tunnel, snapshot).await,
                },
                LifecycleEvent::Resynced { snapshot } => observer.resynced(snapshot).await,
            };

            if let Err(e) = result {
                tracing::warn!(observer = observer.name(), "Observer failed: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        name: String,
        fail: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn record(&self, what: &str, tunnel: &Tunnel) -> anyhow::Result<()> {
            self.calls
                .lock()
                .push(format!("{}:{}:{}", self.name, what, tunnel.instance_id));
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LifecycleObserver for Recorder {
        fn name(&self) -> &str {
            &self.name
        }
        async fn added(&self, tunnel: &Tunnel, _: &Snapshot) -> anyhow::Result<()> {
            self.record("added", tunnel)
        }
        async fn updated(&self, tunnel: &Tunnel, _: &Snapshot) -> anyhow::Result<()> {
            self.record("updated", tunnel)
        }
        async fn removed(&self, tunnel: &Tunnel, _: &Snapshot) -> anyhow::Result<()> {
            self.record("removed", tunnel)
        }
    }

    fn tunnel(id: &str) -> Tunnel {
        let inst: lc_protocol::WorkspaceInstance =
            serde_json::from_value(serde_json::json!({"id": id, "workspaceId": "w"})).unwrap();
        Tunnel::derive(&inst, &Default::default(), "h")
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut set = ObserverSet::new();
        let obs: Arc<dyn LifecycleObserver> = Arc::new(Recorder::default());
        set.register(obs.clone()).unwrap();
        assert!(matches!(
            set.register(obs),
            Err(ObserverError::Duplicate(_))
        ));
        // A different instance of the same type is fine
        set.register(Arc::new(Recorder::default())).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_order_kept() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut set = ObserverSet::new();
        for (name, fail) in [("a", true), ("b", false)] {
            set.register(Arc::new(Recorder {
                name: name.to_string(),
                fail,
                calls: calls.clone(),
            }))
            .unwrap();
        }

        let event = LifecycleEvent::Tunnel {
            kind: EventKind::Removed,
            tunnel: tunnel("i1"),
            snapshot: Snapshot::default(),
        };
        set.dispatch(&event).await;

        assert_eq!(*calls.lock(), vec!["a:removed:i1", "b:removed:i1"]);
    }
}
