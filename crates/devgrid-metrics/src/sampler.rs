//! The sampling loop.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use devgrid_cluster::ClusterRegistry;
use devgrid_state::{EnvStatus, MetricSample, StateStore};

/// Samples workload utilization and persists time-windowed samples.
#[derive(Clone)]
pub struct MetricsSampler {
    state: StateStore,
    registry: Arc<ClusterRegistry>,
    interval: Duration,
    retention: Duration,
    query_timeout: Duration,
}

impl MetricsSampler {
    pub fn new(
        state: StateStore,
        registry: Arc<ClusterRegistry>,
        interval: Duration,
        retention: Duration,
        query_timeout: Duration,
    ) -> Self {
        Self {
            state,
            registry,
            interval,
            retention,
            query_timeout,
        }
    }

    /// Sample every running environment on one cluster.
    ///
    /// A failed utilization query for one environment logs a warning and
    /// moves on. Returns the number of samples appended.
    pub async fn sample_cluster(&self, cluster_id: &str) -> anyhow::Result<u32> {
        let environments = self
            .state
            .list_environments_on_cluster(cluster_id, Some(EnvStatus::Running))?;
        if environments.is_empty() {
            return Ok(0);
        }

        let client = self.registry.client(cluster_id).await?;
        let now = epoch_secs();
        let mut appended = 0;

        for env in &environments {
            let utilization =
                tokio::time::timeout(self.query_timeout, client.utilization(&env.id)).await;
            match utilization {
                Ok(Ok(usage)) => {
                    let sample = MetricSample {
                        environment_id: env.id.clone(),
                        sampled_at: now,
                        cpu_millis: usage.cpu_millis,
                        memory_mib: usage.memory_mib,
                        storage_gib: usage.storage_gib,
                    };
                    if let Err(e) = self.state.put_metric(&sample) {
                        warn!(env_id = %env.id, error = %e, "failed to persist metric sample");
                    } else {
                        appended += 1;
                    }
                }
                Ok(Err(e)) => {
                    warn!(env_id = %env.id, %cluster_id, error = %e, "utilization query failed, skipping");
                }
                Err(_) => {
                    warn!(env_id = %env.id, %cluster_id, "utilization query timed out, skipping");
                }
            }
        }

        debug!(%cluster_id, appended, "cluster sampled");
        Ok(appended)
    }

    /// One sampling round across every registered cluster, each sampled
    /// in its own task so a stuck cluster cannot starve the others.
    pub async fn sample_all(&self) -> anyhow::Result<u32> {
        let clusters = self.registry.list_clusters(None, None)?;
        let mut handles = Vec::with_capacity(clusters.len());

        for cluster in clusters {
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                match this.sample_cluster(&cluster.id).await {
                    Ok(appended) => appended,
                    Err(e) => {
                        warn!(cluster_id = %cluster.id, error = %e, "cluster sampling failed");
                        0
                    }
                }
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap_or(0);
        }
        Ok(total)
    }

    /// Drop samples older than the retention window.
    pub fn purge_expired(&self) -> anyhow::Result<u32> {
        let cutoff = epoch_secs().saturating_sub(self.retention.as_secs());
        Ok(self.state.purge_metrics_before(cutoff)?)
    }

    /// Run the sampling loop until shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            retention_secs = self.retention.as_secs(),
            "metrics sampler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.sample_all().await {
                        warn!(error = %e, "sampling round failed");
                    }
                    if let Err(e) = self.purge_expired() {
                        warn!(error = %e, "metric retention purge failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("metrics sampler shutting down");
                    break;
                }
            }
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
