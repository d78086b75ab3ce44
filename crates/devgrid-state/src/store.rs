//! StateStore — redb-backed document persistence for DevGrid.
//!
//! Provides typed CRUD operations over environments, clusters, terminal
//! sessions, and metric samples. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe document store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ENVIRONMENTS).map_err(map_err!(Table))?;
        txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        txn.open_table(METRICS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Environments ───────────────────────────────────────────────

    /// Insert or update an environment record.
    pub fn put_environment(&self, env: &EnvironmentRecord) -> StateResult<()> {
        let value = serde_json::to_vec(env).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ENVIRONMENTS).map_err(map_err!(Table))?;
            table
                .insert(env.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(env_id = %env.id, status = %env.status, "environment stored");
        Ok(())
    }

    /// Get an environment by id.
    pub fn get_environment(&self, env_id: &str) -> StateResult<Option<EnvironmentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENVIRONMENTS).map_err(map_err!(Table))?;
        match table.get(env_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let env: EnvironmentRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(env))
            }
            None => Ok(None),
        }
    }

    /// List all environment records, terminated ones included.
    pub fn list_environments(&self) -> StateResult<Vec<EnvironmentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENVIRONMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let env: EnvironmentRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(env);
        }
        Ok(results)
    }

    /// List environments owned by a user, optionally filtered by status.
    pub fn list_environments_for_user(
        &self,
        user_id: &str,
        status: Option<EnvStatus>,
    ) -> StateResult<Vec<EnvironmentRecord>> {
        let all = self.list_environments()?;
        Ok(all
            .into_iter()
            .filter(|e| e.user_id == user_id)
            .filter(|e| status.is_none_or(|s| e.status == s))
            .collect())
    }

    /// List environments assigned to a cluster, optionally filtered by status.
    pub fn list_environments_on_cluster(
        &self,
        cluster_id: &str,
        status: Option<EnvStatus>,
    ) -> StateResult<Vec<EnvironmentRecord>> {
        let all = self.list_environments()?;
        Ok(all
            .into_iter()
            .filter(|e| e.cluster_id.as_deref() == Some(cluster_id))
            .filter(|e| status.is_none_or(|s| e.status == s))
            .collect())
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Insert or update a cluster record.
    pub fn put_cluster(&self, cluster: &ClusterRecord) -> StateResult<()> {
        let value = serde_json::to_vec(cluster).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            table
                .insert(cluster.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a cluster by id.
    pub fn get_cluster(&self, cluster_id: &str) -> StateResult<Option<ClusterRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        match table.get(cluster_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let cluster: ClusterRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(cluster))
            }
            None => Ok(None),
        }
    }

    /// List all registered clusters.
    pub fn list_clusters(&self) -> StateResult<Vec<ClusterRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let cluster: ClusterRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(cluster);
        }
        Ok(results)
    }

    /// Delete a cluster by id. Returns true if it existed.
    pub fn delete_cluster(&self, cluster_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            existed = table.remove(cluster_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%cluster_id, existed, "cluster deleted");
        Ok(existed)
    }

    // ── Terminal sessions ──────────────────────────────────────────

    /// Insert or update a session record (write-through from the relay).
    pub fn put_session(&self, session: &SessionRecord) -> StateResult<()> {
        let value = serde_json::to_vec(session).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            table
                .insert(session.connection_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a session by connection id.
    pub fn get_session(&self, connection_id: &str) -> StateResult<Option<SessionRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        match table.get(connection_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let session: SessionRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// List sessions still marked live.
    pub fn list_live_sessions(&self) -> StateResult<Vec<SessionRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let session: SessionRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if session.live {
                results.push(session);
            }
        }
        Ok(results)
    }

    /// Mark every live session dead. Used at startup to reconcile records
    /// left behind by a crashed process; returns the number reconciled.
    pub fn mark_all_sessions_dead(&self) -> StateResult<u32> {
        let live = self.list_live_sessions()?;
        let count = live.len() as u32;
        for mut session in live {
            session.live = false;
            self.put_session(&session)?;
        }
        if count > 0 {
            debug!(count, "orphaned sessions marked dead");
        }
        Ok(count)
    }

    // ── Metric samples ─────────────────────────────────────────────

    /// Append a metric sample.
    pub fn put_metric(&self, sample: &MetricSample) -> StateResult<()> {
        let key = sample.table_key();
        let value = serde_json::to_vec(sample).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(METRICS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List samples for an environment taken at or after `since`
    /// (unix seconds), in time order.
    pub fn list_metrics_for_environment(
        &self,
        environment_id: &str,
        since: u64,
    ) -> StateResult<Vec<MetricSample>> {
        let prefix = format!("{environment_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(METRICS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let sample: MetricSample =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if sample.sampled_at >= since {
                    results.push(sample);
                }
            }
        }
        results.sort_by_key(|s| s.sampled_at);
        Ok(results)
    }

    /// Drop every sample older than `cutoff` (unix seconds), across all
    /// environments. Returns the number purged. This is the retention
    /// expiry; the metrics sampler drives it on its interval.
    pub fn purge_metrics_before(&self, cutoff: u64) -> StateResult<u32> {
        // Collect expired keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(METRICS).map_err(map_err!(Table))?;
            let mut expired = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let sample: MetricSample =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if sample.sampled_at < cutoff {
                    expired.push(key.value().to_string());
                }
            }
            expired
        };
        // Delete in a write transaction.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(METRICS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if count > 0 {
            debug!(count, cutoff, "expired metric samples purged");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_environment(id: &str, user: &str, name: &str) -> EnvironmentRecord {
        EnvironmentRecord {
            id: id.to_string(),
            user_id: user.to_string(),
            name: name.to_string(),
            template: "python".to_string(),
            cluster_id: Some("c-1".to_string()),
            status: EnvStatus::Running,
            resources: ResourceAllocation {
                cpu_millis: 500,
                memory_mib: 512,
                storage_gib: 5,
            },
            workload: format!("ws-{id}"),
            entrypoint: format!("ep-{id}"),
            volume: format!("vol-{id}"),
            created_at: 1000,
            last_active_at: 1000,
            error: None,
            capacity_released: false,
        }
    }

    fn test_cluster(id: &str, region: &str) -> ClusterRecord {
        ClusterRecord {
            id: id.to_string(),
            name: format!("cluster {id}"),
            region: region.to_string(),
            health: ClusterHealth::Healthy,
            credential: SealedCredential {
                payload: "cGF5bG9hZA==".to_string(),
                fingerprint: "00".to_string(),
            },
            capacity: 10,
            active_environments: 0,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_session(connection_id: &str, env_id: &str, live: bool) -> SessionRecord {
        SessionRecord {
            connection_id: connection_id.to_string(),
            environment_id: env_id.to_string(),
            user_id: "u-1".to_string(),
            opened_at: 1000,
            last_heartbeat_at: 1_000_000,
            live,
        }
    }

    // ── Environment CRUD ───────────────────────────────────────────

    #[test]
    fn environment_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let env = test_environment("e-1", "u-1", "dev");

        store.put_environment(&env).unwrap();
        let retrieved = store.get_environment("e-1").unwrap();

        assert_eq!(retrieved, Some(env));
    }

    #[test]
    fn environment_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_environment("nope").unwrap().is_none());
    }

    #[test]
    fn environment_update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let mut env = test_environment("e-1", "u-1", "dev");
        store.put_environment(&env).unwrap();

        env.status = EnvStatus::Stopped;
        env.last_active_at = 2000;
        store.put_environment(&env).unwrap();

        let retrieved = store.get_environment("e-1").unwrap().unwrap();
        assert_eq!(retrieved.status, EnvStatus::Stopped);
        assert_eq!(retrieved.last_active_at, 2000);
    }

    #[test]
    fn environment_list_for_user_filters_owner_and_status() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_environment(&test_environment("e-1", "alice", "a")).unwrap();
        store.put_environment(&test_environment("e-2", "alice", "b")).unwrap();
        store.put_environment(&test_environment("e-3", "bob", "c")).unwrap();

        let mut stopped = test_environment("e-4", "alice", "d");
        stopped.status = EnvStatus::Stopped;
        store.put_environment(&stopped).unwrap();

        assert_eq!(
            store.list_environments_for_user("alice", None).unwrap().len(),
            3
        );
        assert_eq!(
            store
                .list_environments_for_user("alice", Some(EnvStatus::Running))
                .unwrap()
                .len(),
            2
        );
        assert_eq!(store.list_environments_for_user("bob", None).unwrap().len(), 1);
    }

    #[test]
    fn environment_list_on_cluster() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_environment(&test_environment("e-1", "u-1", "a")).unwrap();

        let mut other = test_environment("e-2", "u-1", "b");
        other.cluster_id = Some("c-2".to_string());
        store.put_environment(&other).unwrap();

        let mut unassigned = test_environment("e-3", "u-1", "c");
        unassigned.cluster_id = None;
        store.put_environment(&unassigned).unwrap();

        let on_c1 = store.list_environments_on_cluster("c-1", None).unwrap();
        assert_eq!(on_c1.len(), 1);
        assert_eq!(on_c1[0].id, "e-1");
    }

    // ── Cluster CRUD ───────────────────────────────────────────────

    #[test]
    fn cluster_put_get_list_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_cluster(&test_cluster("c-1", "us-east")).unwrap();
        store.put_cluster(&test_cluster("c-2", "eu-west")).unwrap();

        assert_eq!(store.list_clusters().unwrap().len(), 2);
        assert_eq!(
            store.get_cluster("c-2").unwrap().unwrap().region,
            "eu-west"
        );

        assert!(store.delete_cluster("c-1").unwrap());
        assert!(!store.delete_cluster("c-1").unwrap());
        assert_eq!(store.list_clusters().unwrap().len(), 1);
    }

    // ── Session CRUD ───────────────────────────────────────────────

    #[test]
    fn session_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let session = test_session("conn-1", "e-1", true);

        store.put_session(&session).unwrap();
        assert_eq!(store.get_session("conn-1").unwrap(), Some(session));
    }

    #[test]
    fn live_sessions_excludes_dead_ones() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_session(&test_session("conn-1", "e-1", true)).unwrap();
        store.put_session(&test_session("conn-2", "e-1", false)).unwrap();
        store.put_session(&test_session("conn-3", "e-2", true)).unwrap();

        let live = store.list_live_sessions().unwrap();
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|s| s.live));
    }

    #[test]
    fn mark_all_sessions_dead_reconciles_orphans() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_session(&test_session("conn-1", "e-1", true)).unwrap();
        store.put_session(&test_session("conn-2", "e-2", true)).unwrap();
        store.put_session(&test_session("conn-3", "e-3", false)).unwrap();

        let reconciled = store.mark_all_sessions_dead().unwrap();
        assert_eq!(reconciled, 2);
        assert!(store.list_live_sessions().unwrap().is_empty());
        // Records are retained, just no longer live.
        assert!(store.get_session("conn-1").unwrap().is_some());
    }

    // ── Metric samples ─────────────────────────────────────────────

    fn sample(env: &str, at: u64) -> MetricSample {
        MetricSample {
            environment_id: env.to_string(),
            sampled_at: at,
            cpu_millis: 120,
            memory_mib: 300,
            storage_gib: 2,
        }
    }

    #[test]
    fn metrics_put_and_list_in_time_order() {
        let store = StateStore::open_in_memory().unwrap();
        for at in [3000u64, 1000, 2000] {
            store.put_metric(&sample("e-1", at)).unwrap();
        }
        store.put_metric(&sample("e-2", 1500)).unwrap();

        let series = store.list_metrics_for_environment("e-1", 0).unwrap();
        assert_eq!(
            series.iter().map(|s| s.sampled_at).collect::<Vec<_>>(),
            vec![1000, 2000, 3000]
        );
    }

    #[test]
    fn metrics_since_filters_older_samples() {
        let store = StateStore::open_in_memory().unwrap();
        for at in [1000u64, 2000, 3000] {
            store.put_metric(&sample("e-1", at)).unwrap();
        }

        let recent = store.list_metrics_for_environment("e-1", 2000).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].sampled_at, 2000);
    }

    #[test]
    fn purge_drops_only_expired_samples() {
        let store = StateStore::open_in_memory().unwrap();
        for at in [1000u64, 2000, 3000] {
            store.put_metric(&sample("e-1", at)).unwrap();
        }
        store.put_metric(&sample("e-2", 1500)).unwrap();

        let purged = store.purge_metrics_before(2000).unwrap();
        assert_eq!(purged, 2); // e-1@1000 and e-2@1500.

        let remaining = store.list_metrics_for_environment("e-1", 0).unwrap();
        assert_eq!(
            remaining.iter().map(|s| s.sampled_at).collect::<Vec<_>>(),
            vec![2000, 3000]
        );
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_environment(&test_environment("e-1", "u-1", "dev")).unwrap();
            store.put_session(&test_session("conn-1", "e-1", true)).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_environment("e-1").unwrap().is_some());
        // The live flag survives too — reconciliation is a separate step.
        assert_eq!(store.list_live_sessions().unwrap().len(), 1);
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_environments().unwrap().is_empty());
        assert!(store.list_clusters().unwrap().is_empty());
        assert!(store.list_live_sessions().unwrap().is_empty());
        assert!(store.list_metrics_for_environment("any", 0).unwrap().is_empty());
        assert_eq!(store.mark_all_sessions_dead().unwrap(), 0);
        assert_eq!(store.purge_metrics_before(u64::MAX).unwrap(), 0);
        assert!(!store.delete_cluster("nope").unwrap());
    }
}
