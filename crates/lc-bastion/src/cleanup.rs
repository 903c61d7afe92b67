//! Pending expose cleanup task
//!
//! Expose requests for instances that are not tracked yet are buffered for
//! a limited time (see `pending_expose_ttl`). Expired requests are pruned
//! lazily on every state change; this task also prunes them periodically so
//! they do not linger while nothing else happens.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bastion::Bastion;

/// Interval between cleanup passes
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Run the cleanup task until cancelled
pub async fn run_pending_cleanup(bastion: Arc<Bastion>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);

    tracing::info!(
        "Starting pending expose cleanup (ttl: {:?}, check interval: {:?})",
        bastion.config().pending_expose_ttl,
        CLEANUP_INTERVAL
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let pruned = bastion.prune_expired_pending();
                if pruned > 0 {
                    tracing::info!("Dropped {} expired expose requests", pruned);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Pending expose cleanup shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bastion::BastionConfig;
    use crate::observer::ObserverSet;

    #[test]
    fn test_cleanup_interval_is_reasonable() {
        assert!(CLEANUP_INTERVAL >= Duration::from_secs(5));
        assert!(CLEANUP_INTERVAL <= Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_prunes_and_stops() {
        let bastion = Bastion::new(
            BastionConfig {
                origin_host: "gitpod.io".to_string(),
                auto_tunnel: true,
                pending_expose_ttl: Duration::from_secs(60),
                liveness_timeout: Duration::from_secs(1),
                liveness_attempts: 1,
            },
            ObserverSet::new(),
        );
        bastion.expose("i1", 8080, None).await.unwrap();
        assert_eq!(bastion.pending_count(), 1);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_pending_cleanup(bastion.clone(), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(91)).await;
        assert_eq!(bastion.pending_count(), 0);

        cancel.cancel();
        task.await.unwrap();
    }
}
