//! Cluster health tracking.
//!
//! A [`HealthTracker`] applies the consecutive-failure/success thresholds
//! to probe outcomes; a [`HealthMonitor`] runs one background ping loop
//! per registered cluster, independent of any environment operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use devgrid_state::ClusterHealth;

use crate::registry::ClusterRegistry;

/// Tracks consecutive probe outcomes for a single cluster.
///
/// Thresholds: `unreachable_threshold` consecutive failures mark the
/// cluster `Unreachable`; a single success while unreachable recovers it
/// to `Degraded`; `healthy_threshold` further consecutive successes
/// restore `Healthy`.
#[derive(Debug)]
pub struct HealthTracker {
    status: ClusterHealth,
    consecutive_failures: u32,
    consecutive_successes: u32,
    unreachable_threshold: u32,
    healthy_threshold: u32,
}

impl HealthTracker {
    pub fn new(
        initial: ClusterHealth,
        unreachable_threshold: u32,
        healthy_threshold: u32,
    ) -> Self {
        Self {
            status: initial,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unreachable_threshold,
            healthy_threshold,
        }
    }

    /// Record a probe outcome and return the new health status.
    pub fn record(&mut self, success: bool) -> ClusterHealth {
        if success {
            self.consecutive_failures = 0;
            if self.status == ClusterHealth::Unreachable {
                // First sign of life: degraded, not yet trusted.
                self.status = ClusterHealth::Degraded;
                self.consecutive_successes = 0;
                debug!("cluster recovered to degraded");
            } else {
                self.consecutive_successes += 1;
                if self.status == ClusterHealth::Degraded
                    && self.consecutive_successes >= self.healthy_threshold
                {
                    self.status = ClusterHealth::Healthy;
                    debug!(
                        successes = self.consecutive_successes,
                        "cluster restored to healthy"
                    );
                }
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.unreachable_threshold
                && self.status != ClusterHealth::Unreachable
            {
                warn!(
                    failures = self.consecutive_failures,
                    threshold = self.unreachable_threshold,
                    "cluster marked unreachable"
                );
                self.status = ClusterHealth::Unreachable;
            }
        }
        self.status
    }

    pub fn status(&self) -> ClusterHealth {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Per-cluster monitor state.
struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages the background health loops for all registered clusters.
pub struct HealthMonitor {
    registry: Arc<ClusterRegistry>,
    interval: Duration,
    timeout: Duration,
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<ClusterRegistry>, interval: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            timeout,
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a health loop for every cluster currently registered.
    pub async fn start_all(&self) -> anyhow::Result<()> {
        for cluster in self.registry.list_clusters(None, None)? {
            self.start_monitor(&cluster.id).await;
        }
        Ok(())
    }

    /// Start (or restart) the health loop for one cluster.
    pub async fn start_monitor(&self, cluster_id: &str) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let registry = self.registry.clone();
        let cluster_id_owned = cluster_id.to_string();
        let interval = self.interval;
        let timeout = self.timeout;

        let handle = tokio::spawn(async move {
            run_health_loop(registry, &cluster_id_owned, interval, timeout, shutdown_rx).await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            cluster_id.to_string(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(%cluster_id, "cluster health monitor started");
    }

    /// Stop the health loop for one cluster.
    pub async fn stop_monitor(&self, cluster_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(cluster_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%cluster_id, "cluster health monitor stopped");
        }
    }

    /// Stop all loops (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (id, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(cluster_id = %id, "cluster health monitor stopped");
        }
        info!("all cluster health monitors stopped");
    }

    /// Cluster ids with an active monitor.
    pub async fn active_monitors(&self) -> Vec<String> {
        let monitors = self.monitors.read().await;
        monitors.keys().cloned().collect()
    }
}

/// The ping loop for a single cluster.
async fn run_health_loop(
    registry: Arc<ClusterRegistry>,
    cluster_id: &str,
    interval: Duration,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%cluster_id, "health loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let success = probe_cluster(&registry, cluster_id, timeout).await;
                if let Err(e) = registry.record_health(cluster_id, success).await {
                    warn!(%cluster_id, error = %e, "failed to record health result");
                }
            }
            _ = shutdown.changed() => {
                debug!(%cluster_id, "health loop shutting down");
                break;
            }
        }
    }
}

/// One bounded-timeout ping. Any failure — resolve, connect, or the ping
/// itself — counts as a probe failure.
async fn probe_cluster(
    registry: &ClusterRegistry,
    cluster_id: &str,
    timeout: Duration,
) -> bool {
    let client = match registry.client(cluster_id).await {
        Ok(c) => c,
        Err(e) => {
            debug!(%cluster_id, error = %e, "health probe could not get client");
            return false;
        }
    };

    match tokio::time::timeout(timeout, client.ping()).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(%cluster_id, error = %e, "health probe failed");
            false
        }
        Err(_) => {
            debug!(%cluster_id, "health probe timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_cluster_survives_failures_under_threshold() {
        let mut tracker = HealthTracker::new(ClusterHealth::Healthy, 3, 2);
        tracker.record(false);
        tracker.record(false);
        assert_eq!(tracker.status(), ClusterHealth::Healthy);
        assert_eq!(tracker.consecutive_failures(), 2);
    }

    #[test]
    fn threshold_failures_mark_unreachable() {
        let mut tracker = HealthTracker::new(ClusterHealth::Healthy, 3, 2);
        tracker.record(false);
        tracker.record(false);
        let status = tracker.record(false);
        assert_eq!(status, ClusterHealth::Unreachable);
    }

    #[test]
    fn single_success_recovers_to_degraded_only() {
        let mut tracker = HealthTracker::new(ClusterHealth::Unreachable, 3, 2);
        let status = tracker.record(true);
        assert_eq!(status, ClusterHealth::Degraded);
    }

    #[test]
    fn sustained_successes_restore_healthy() {
        let mut tracker = HealthTracker::new(ClusterHealth::Unreachable, 3, 2);
        tracker.record(true); // degraded
        tracker.record(true);
        assert_eq!(tracker.status(), ClusterHealth::Degraded);
        let status = tracker.record(true);
        assert_eq!(status, ClusterHealth::Healthy);
    }

    #[test]
    fn mixed_outcomes_reset_counters() {
        let mut tracker = HealthTracker::new(ClusterHealth::Healthy, 3, 2);
        tracker.record(false);
        tracker.record(false);
        tracker.record(true); // resets the failure run
        tracker.record(false);
        tracker.record(false);
        assert_eq!(tracker.status(), ClusterHealth::Healthy);

        // A fresh full run still trips the threshold.
        tracker.record(false);
        assert_eq!(tracker.status(), ClusterHealth::Unreachable);
    }

    #[test]
    fn failure_during_recovery_restarts_the_climb() {
        let mut tracker = HealthTracker::new(ClusterHealth::Unreachable, 3, 2);
        tracker.record(true); // degraded
        tracker.record(true);
        tracker.record(false);
        assert_eq!(tracker.status(), ClusterHealth::Degraded);

        // Needs the full healthy_threshold again.
        tracker.record(true);
        assert_eq!(tracker.status(), ClusterHealth::Degraded);
        tracker.record(true);
        assert_eq!(tracker.status(), ClusterHealth::Healthy);
    }
}
