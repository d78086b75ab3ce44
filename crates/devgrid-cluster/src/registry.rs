//! Cluster registry — records, clients, capacity, and selection.
//!
//! The registry fronts the persisted [`ClusterRecord`]s: it resolves
//! credentials into cached [`ClusterApi`] clients, applies health probe
//! results through per-cluster [`HealthTracker`]s, accounts soft capacity
//! slots, and implements the selection policy used when a new environment
//! needs a home.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use devgrid_state::{ClusterHealth, ClusterRecord, StateStore};

use crate::api::{ClusterApi, ClusterConnector};
use crate::credential::open_credential;
use crate::error::{RegistryError, RegistryResult};
use crate::health::HealthTracker;

/// Availability summary for one region (user-facing listing).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RegionAvailability {
    pub region: String,
    pub clusters: u32,
    pub available: bool,
}

pub struct ClusterRegistry {
    state: StateStore,
    connector: Arc<dyn ClusterConnector>,
    /// Cached clients: cluster id → live API handle.
    clients: RwLock<HashMap<String, Arc<dyn ClusterApi>>>,
    /// Health trackers, created lazily from the stored status.
    trackers: Mutex<HashMap<String, HealthTracker>>,
    /// Serializes every capacity counter read-modify-write.
    capacity_lock: Mutex<()>,
    unreachable_threshold: u32,
    healthy_threshold: u32,
}

impl ClusterRegistry {
    pub fn new(
        state: StateStore,
        connector: Arc<dyn ClusterConnector>,
        unreachable_threshold: u32,
        healthy_threshold: u32,
    ) -> Self {
        Self {
            state,
            connector,
            clients: RwLock::new(HashMap::new()),
            trackers: Mutex::new(HashMap::new()),
            capacity_lock: Mutex::new(()),
            unreachable_threshold,
            healthy_threshold,
        }
    }

    /// List clusters, optionally filtered by health and region.
    pub fn list_clusters(
        &self,
        health: Option<ClusterHealth>,
        region: Option<&str>,
    ) -> RegistryResult<Vec<ClusterRecord>> {
        let all = self.state.list_clusters()?;
        Ok(all
            .into_iter()
            .filter(|c| health.is_none_or(|h| c.health == h))
            .filter(|c| region.is_none_or(|r| c.region == r))
            .collect())
    }

    /// Get one cluster record.
    pub fn get_cluster(&self, cluster_id: &str) -> RegistryResult<ClusterRecord> {
        self.state
            .get_cluster(cluster_id)?
            .ok_or_else(|| RegistryError::UnknownCluster(cluster_id.to_string()))
    }

    /// Resolve the API client for a cluster, connecting on first use.
    ///
    /// The sealed credential is decoded and fingerprint-checked before it
    /// reaches the connector; the resulting client is cached.
    pub async fn client(&self, cluster_id: &str) -> RegistryResult<Arc<dyn ClusterApi>> {
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(cluster_id) {
                return Ok(client.clone());
            }
        }

        let record = self.get_cluster(cluster_id)?;
        let credential = open_credential(&record.credential)?;
        let client = self
            .connector
            .connect(&record, &credential)
            .map_err(|e| RegistryError::Connect(e.to_string()))?;

        let mut clients = self.clients.write().await;
        let client = clients
            .entry(cluster_id.to_string())
            .or_insert(client)
            .clone();
        debug!(%cluster_id, "cluster client connected");
        Ok(client)
    }

    /// Drop the cached client for a cluster (credential rotation, removal).
    pub async fn invalidate(&self, cluster_id: &str) {
        let mut clients = self.clients.write().await;
        clients.remove(cluster_id);
        let mut trackers = self.trackers.lock().await;
        trackers.remove(cluster_id);
    }

    /// Apply a health probe outcome, writing status changes through.
    pub async fn record_health(
        &self,
        cluster_id: &str,
        success: bool,
    ) -> RegistryResult<ClusterHealth> {
        let mut record = self.get_cluster(cluster_id)?;

        let mut trackers = self.trackers.lock().await;
        let tracker = trackers.entry(cluster_id.to_string()).or_insert_with(|| {
            HealthTracker::new(
                record.health,
                self.unreachable_threshold,
                self.healthy_threshold,
            )
        });

        let previous = record.health;
        let status = tracker.record(success);
        if status != previous {
            record.health = status;
            record.updated_at = epoch_secs();
            self.state.put_cluster(&record)?;
            info!(%cluster_id, from = ?previous, to = ?status, "cluster health changed");
        }
        Ok(status)
    }

    // ── Capacity & selection ───────────────────────────────────────

    /// Pick a cluster for a new environment and claim a capacity slot on
    /// it, atomically with respect to other selections.
    ///
    /// Policy: healthy clusters with spare capacity in the preferred
    /// region first; otherwise the least-loaded healthy cluster; fails
    /// with `NoAvailableCluster` when none qualify.
    pub async fn select_and_reserve(
        &self,
        preferred_region: Option<&str>,
    ) -> RegistryResult<ClusterRecord> {
        let _guard = self.capacity_lock.lock().await;

        let candidates: Vec<ClusterRecord> = self
            .state
            .list_clusters()?
            .into_iter()
            .filter(|c| c.health == ClusterHealth::Healthy && c.has_capacity())
            .collect();

        let chosen = preferred_region
            .and_then(|region| {
                pick_least_loaded(candidates.iter().filter(|c| c.region == region))
            })
            .or_else(|| pick_least_loaded(candidates.iter()))
            .ok_or(RegistryError::NoAvailableCluster)?;

        let mut record = chosen.clone();
        record.active_environments += 1;
        record.updated_at = epoch_secs();
        self.state.put_cluster(&record)?;
        debug!(
            cluster_id = %record.id,
            active = record.active_environments,
            capacity = record.capacity,
            "capacity slot reserved"
        );
        Ok(record)
    }

    /// Release a previously reserved capacity slot (environment deleted
    /// or its provisioning terminally failed).
    pub async fn release_slot(&self, cluster_id: &str) -> RegistryResult<()> {
        let _guard = self.capacity_lock.lock().await;
        let mut record = self.get_cluster(cluster_id)?;
        record.active_environments = record.active_environments.saturating_sub(1);
        record.updated_at = epoch_secs();
        self.state.put_cluster(&record)?;
        debug!(
            %cluster_id,
            active = record.active_environments,
            "capacity slot released"
        );
        Ok(())
    }

    /// Summarize regions and whether each can take a new environment.
    pub fn region_availability(&self) -> RegistryResult<Vec<RegionAvailability>> {
        let clusters = self.state.list_clusters()?;
        let mut regions: HashMap<String, (u32, bool)> = HashMap::new();
        for c in &clusters {
            let entry = regions.entry(c.region.clone()).or_insert((0, false));
            entry.0 += 1;
            if c.health == ClusterHealth::Healthy && c.has_capacity() {
                entry.1 = true;
            }
        }
        let mut out: Vec<RegionAvailability> = regions
            .into_iter()
            .map(|(region, (clusters, available))| RegionAvailability {
                region,
                clusters,
                available,
            })
            .collect();
        out.sort_by(|a, b| a.region.cmp(&b.region));
        Ok(out)
    }

    /// The backing store (shared with the other subsystems).
    pub fn state(&self) -> &StateStore {
        &self.state
    }
}

/// Least-loaded = smallest fraction of capacity in use.
fn pick_least_loaded<'a>(
    candidates: impl Iterator<Item = &'a ClusterRecord>,
) -> Option<ClusterRecord> {
    candidates
        .min_by(|a, b| {
            let load_a = a.active_environments as f64 / a.capacity.max(1) as f64;
            let load_b = b.active_environments as f64 / b.capacity.max(1) as f64;
            load_a.total_cmp(&load_b)
        })
        .cloned()
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        ApiResult, ClusterApiError, ExecStream, Utilization, WorkloadPhase, WorkloadSpec,
    };
    use crate::credential::seal_credential;
    use async_trait::async_trait;

    /// A connector whose clients answer pings from a shared switch.
    struct FakeConnector {
        reachable: Arc<std::sync::atomic::AtomicBool>,
    }

    struct FakeClient {
        reachable: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl ClusterApi for FakeClient {
        async fn create_volume(&self, _: &str, _: u64) -> ApiResult<()> {
            Ok(())
        }
        async fn create_workload(&self, _: &WorkloadSpec) -> ApiResult<()> {
            Ok(())
        }
        async fn create_entrypoint(&self, _: &str) -> ApiResult<()> {
            Ok(())
        }
        async fn scale_workload(&self, _: &str, _: u32) -> ApiResult<()> {
            Ok(())
        }
        async fn delete_workload(&self, _: &str) -> ApiResult<()> {
            Ok(())
        }
        async fn delete_entrypoint(&self, _: &str) -> ApiResult<()> {
            Ok(())
        }
        async fn delete_volume(&self, _: &str) -> ApiResult<()> {
            Ok(())
        }
        async fn workload_phase(&self, _: &str) -> ApiResult<WorkloadPhase> {
            Ok(WorkloadPhase::Ready)
        }
        async fn open_exec(&self, _: &str) -> ApiResult<ExecStream> {
            Err(ClusterApiError::Unavailable("not in this test".into()))
        }
        async fn utilization(&self, _: &str) -> ApiResult<Utilization> {
            Ok(Utilization {
                cpu_millis: 0,
                memory_mib: 0,
                storage_gib: 0,
            })
        }
        async fn ping(&self) -> ApiResult<()> {
            if self.reachable.load(std::sync::atomic::Ordering::Relaxed) {
                Ok(())
            } else {
                Err(ClusterApiError::Unavailable("switched off".into()))
            }
        }
    }

    impl ClusterConnector for FakeConnector {
        fn connect(
            &self,
            _cluster: &ClusterRecord,
            _credential: &[u8],
        ) -> anyhow::Result<Arc<dyn ClusterApi>> {
            Ok(Arc::new(FakeClient {
                reachable: self.reachable.clone(),
            }))
        }
    }

    fn test_registry() -> Arc<ClusterRegistry> {
        let state = StateStore::open_in_memory().unwrap();
        let connector = Arc::new(FakeConnector {
            reachable: Arc::new(std::sync::atomic::AtomicBool::new(true)),
        });
        Arc::new(ClusterRegistry::new(state, connector, 3, 2))
    }

    fn cluster(id: &str, region: &str, capacity: u32, active: u32) -> ClusterRecord {
        ClusterRecord {
            id: id.to_string(),
            name: id.to_string(),
            region: region.to_string(),
            health: ClusterHealth::Healthy,
            credential: seal_credential(b"creds"),
            capacity,
            active_environments: active,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[tokio::test]
    async fn selection_prefers_declared_region() {
        let registry = test_registry();
        registry.state().put_cluster(&cluster("c-east", "us-east", 10, 9)).unwrap();
        registry.state().put_cluster(&cluster("c-west", "us-west", 10, 0)).unwrap();

        // us-east is nearly full but still preferred over the empty west.
        let chosen = registry.select_and_reserve(Some("us-east")).await.unwrap();
        assert_eq!(chosen.id, "c-east");
    }

    #[tokio::test]
    async fn selection_falls_back_to_least_loaded() {
        let registry = test_registry();
        registry.state().put_cluster(&cluster("c-1", "us-east", 10, 7)).unwrap();
        registry.state().put_cluster(&cluster("c-2", "us-west", 10, 2)).unwrap();

        // Preferred region has no clusters at all.
        let chosen = registry.select_and_reserve(Some("ap-south")).await.unwrap();
        assert_eq!(chosen.id, "c-2");
    }

    #[tokio::test]
    async fn selection_never_picks_unreachable_or_full() {
        let registry = test_registry();
        let mut bad = cluster("c-down", "us-east", 10, 0);
        bad.health = ClusterHealth::Unreachable;
        registry.state().put_cluster(&bad).unwrap();
        registry.state().put_cluster(&cluster("c-full", "us-east", 2, 2)).unwrap();

        let err = registry.select_and_reserve(Some("us-east")).await.unwrap_err();
        assert!(matches!(err, RegistryError::NoAvailableCluster));
    }

    #[tokio::test]
    async fn degraded_clusters_are_not_selected() {
        let registry = test_registry();
        let mut degraded = cluster("c-1", "us-east", 10, 0);
        degraded.health = ClusterHealth::Degraded;
        registry.state().put_cluster(&degraded).unwrap();

        let err = registry.select_and_reserve(None).await.unwrap_err();
        assert!(matches!(err, RegistryError::NoAvailableCluster));
    }

    #[tokio::test]
    async fn reserve_and_release_round_trip() {
        let registry = test_registry();
        registry.state().put_cluster(&cluster("c-1", "us-east", 10, 0)).unwrap();

        let chosen = registry.select_and_reserve(None).await.unwrap();
        assert_eq!(chosen.active_environments, 1);
        assert_eq!(
            registry.get_cluster("c-1").unwrap().active_environments,
            1
        );

        registry.release_slot("c-1").await.unwrap();
        assert_eq!(
            registry.get_cluster("c-1").unwrap().active_environments,
            0
        );
    }

    #[tokio::test]
    async fn reservations_never_oversubscribe() {
        let registry = test_registry();
        registry.state().put_cluster(&cluster("c-1", "us-east", 2, 0)).unwrap();

        assert!(registry.select_and_reserve(None).await.is_ok());
        assert!(registry.select_and_reserve(None).await.is_ok());
        let err = registry.select_and_reserve(None).await.unwrap_err();
        assert!(matches!(err, RegistryError::NoAvailableCluster));

        let record = registry.get_cluster("c-1").unwrap();
        assert_eq!(record.active_environments, 2);
    }

    #[tokio::test]
    async fn record_health_writes_status_through() {
        let registry = test_registry();
        registry.state().put_cluster(&cluster("c-1", "us-east", 10, 0)).unwrap();

        for _ in 0..3 {
            registry.record_health("c-1", false).await.unwrap();
        }
        assert_eq!(
            registry.get_cluster("c-1").unwrap().health,
            ClusterHealth::Unreachable
        );

        registry.record_health("c-1", true).await.unwrap();
        assert_eq!(
            registry.get_cluster("c-1").unwrap().health,
            ClusterHealth::Degraded
        );

        registry.record_health("c-1", true).await.unwrap();
        registry.record_health("c-1", true).await.unwrap();
        assert_eq!(
            registry.get_cluster("c-1").unwrap().health,
            ClusterHealth::Healthy
        );
    }

    #[tokio::test]
    async fn client_is_cached_until_invalidated() {
        let registry = test_registry();
        registry.state().put_cluster(&cluster("c-1", "us-east", 10, 0)).unwrap();

        let a = registry.client("c-1").await.unwrap();
        let b = registry.client("c-1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        registry.invalidate("c-1").await;
        let c = registry.client("c-1").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn client_for_unknown_cluster_fails() {
        let registry = test_registry();
        let err = registry.client("nope").await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownCluster(_)));
    }

    #[tokio::test]
    async fn region_availability_summary() {
        let registry = test_registry();
        registry.state().put_cluster(&cluster("c-1", "us-east", 2, 2)).unwrap();
        registry.state().put_cluster(&cluster("c-2", "us-east", 10, 0)).unwrap();
        let mut down = cluster("c-3", "eu-west", 10, 0);
        down.health = ClusterHealth::Unreachable;
        registry.state().put_cluster(&down).unwrap();

        let regions = registry.region_availability().unwrap();
        assert_eq!(regions.len(), 2);
        let east = regions.iter().find(|r| r.region == "us-east").unwrap();
        assert_eq!(east.clusters, 2);
        assert!(east.available);
        let west = regions.iter().find(|r| r.region == "eu-west").unwrap();
        assert!(!west.available);
    }
}
