//! Orchestrator — drives environments through their lifecycle.
//!
//! Every state transition happens while the environment's lock is held,
//! so concurrent operations on one environment serialize and operations
//! on different environments stay independent. Create additionally
//! serializes per user to make name-uniqueness and quota checks sound
//! under concurrency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use devgrid_cluster::{ClusterApi, ClusterRegistry, WorkloadPhase, WorkloadSpec};
use devgrid_core::Principal;
use devgrid_state::{EnvStatus, EnvironmentRecord, StateStore};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::machine::transition_allowed;
use crate::quota::{check_quota, default_allocation, limits_for};
use crate::retry::RetryPolicy;

/// Keyed async locks, created on demand. Cloning shares the map.
#[derive(Clone, Default)]
struct KeyedLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl KeyedLocks {
    async fn get(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().await;
        map.entry(key.to_string()).or_default().clone()
    }
}

/// The environment lifecycle engine.
#[derive(Clone)]
pub struct Orchestrator {
    state: StateStore,
    registry: Arc<ClusterRegistry>,
    env_locks: KeyedLocks,
    user_locks: KeyedLocks,
    retry: RetryPolicy,
    poll_interval: Duration,
    provision_deadline: Duration,
}

impl Orchestrator {
    pub fn new(
        state: StateStore,
        registry: Arc<ClusterRegistry>,
        retry: RetryPolicy,
        poll_interval: Duration,
        provision_deadline: Duration,
    ) -> Self {
        Self {
            state,
            registry,
            env_locks: KeyedLocks::default(),
            user_locks: KeyedLocks::default(),
            retry,
            poll_interval,
            provision_deadline,
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    /// List a user's environments, terminated ones included.
    pub fn list_environments(&self, user_id: &str) -> OrchestratorResult<Vec<EnvironmentRecord>> {
        Ok(self.state.list_environments_for_user(user_id, None)?)
    }

    /// Get one environment, scoped to its owner.
    pub fn get_environment(
        &self,
        user_id: &str,
        env_id: &str,
    ) -> OrchestratorResult<EnvironmentRecord> {
        self.owned_environment(user_id, env_id)
    }

    // ── Create ─────────────────────────────────────────────────────

    /// Create a new environment for the principal.
    ///
    /// Returns the record in `Creating` status; a spawned provisioning
    /// task drives it to `Running` or `Error`.
    pub async fn create(
        &self,
        principal: &Principal,
        name: &str,
        template: &str,
    ) -> OrchestratorResult<EnvironmentRecord> {
        // Serialize creates per user so two racing calls cannot both pass
        // the uniqueness and quota checks.
        let user_lock = self.user_locks.get(&principal.user_id).await;
        let _user_guard = user_lock.lock_owned().await;

        let existing = self
            .state
            .list_environments_for_user(&principal.user_id, None)?;

        if existing
            .iter()
            .any(|e| e.name == name && e.status.is_active())
        {
            return Err(OrchestratorError::NameConflict(name.to_string()));
        }

        let requested = default_allocation(principal.tier);
        if let Some(violation) = check_quota(limits_for(principal.tier), &existing, requested) {
            return Err(OrchestratorError::QuotaExceeded(violation));
        }

        let cluster = self
            .registry
            .select_and_reserve(principal.preferred_region.as_deref())
            .await?;

        let id = Uuid::new_v4().to_string();
        let now = epoch_secs();
        let env = EnvironmentRecord {
            id: id.clone(),
            user_id: principal.user_id.clone(),
            name: name.to_string(),
            template: template.to_string(),
            cluster_id: Some(cluster.id.clone()),
            status: EnvStatus::Creating,
            resources: requested,
            workload: format!("ws-{id}"),
            entrypoint: format!("ep-{id}"),
            volume: format!("vol-{id}"),
            created_at: now,
            last_active_at: now,
            error: None,
            capacity_released: false,
        };
        self.state.put_environment(&env)?;

        info!(
            env_id = %id,
            user_id = %principal.user_id,
            %name,
            cluster_id = %cluster.id,
            "environment creation started"
        );

        let this = self.clone();
        let env_id = id.clone();
        tokio::spawn(async move {
            this.provision(env_id).await;
        });

        Ok(env)
    }

    /// Issue the initial resource creation calls, then hand off to the
    /// ready poll. Runs as a spawned task; faults land on the record.
    async fn provision(&self, env_id: String) {
        {
            let lock = self.env_locks.get(&env_id).await;
            let _guard = lock.lock_owned().await;

            let env = match self.state.get_environment(&env_id) {
                Ok(Some(env)) => env,
                _ => return,
            };
            // A Delete that won the lock first cancels us.
            if env.status != EnvStatus::Creating {
                debug!(%env_id, status = %env.status, "provisioning abandoned");
                return;
            }
            let Some(cluster_id) = env.cluster_id.clone() else {
                self.mark_error_locked(env, "no cluster assigned".to_string(), true)
                    .await;
                return;
            };

            let client = match self.registry.client(&cluster_id).await {
                Ok(c) => c,
                Err(e) => {
                    self.mark_error_locked(env, format!("cluster client: {e}"), true)
                        .await;
                    return;
                }
            };

            let spec = WorkloadSpec {
                environment_id: env_id.clone(),
                image: env.template.clone(),
                resources: env.resources,
            };
            if let Err(e) = self.create_resources(&client, &spec).await {
                self.mark_error_locked(env, e.to_string(), true).await;
                return;
            }
        }

        self.ready_poll(env_id, true).await;
    }

    /// Volume, then workload, then entrypoint — each idempotent and
    /// retried on transient faults.
    async fn create_resources(
        &self,
        client: &Arc<dyn ClusterApi>,
        spec: &WorkloadSpec,
    ) -> Result<(), devgrid_cluster::ClusterApiError> {
        let env_id = spec.environment_id.clone();
        let storage = spec.resources.storage_gib;

        {
            let client = client.clone();
            let env_id = env_id.clone();
            self.retry
                .call("create_volume", move || {
                    let client = client.clone();
                    let env_id = env_id.clone();
                    async move { client.create_volume(&env_id, storage).await }
                })
                .await?;
        }
        {
            let client = client.clone();
            let spec = spec.clone();
            self.retry
                .call("create_workload", move || {
                    let client = client.clone();
                    let spec = spec.clone();
                    async move { client.create_workload(&spec).await }
                })
                .await?;
        }
        {
            let client = client.clone();
            let env_id = env_id.clone();
            self.retry
                .call("create_entrypoint", move || {
                    let client = client.clone();
                    let env_id = env_id.clone();
                    async move { client.create_entrypoint(&env_id).await }
                })
                .await?;
        }
        Ok(())
    }

    /// Poll the workload phase until ready, failed, or deadline.
    ///
    /// The environment lock is re-taken per iteration so a Delete can
    /// slot in between polls and cancel the operation.
    async fn ready_poll(&self, env_id: String, release_on_fail: bool) {
        let deadline = tokio::time::Instant::now() + self.provision_deadline;

        loop {
            {
                let lock = self.env_locks.get(&env_id).await;
                let _guard = lock.lock_owned().await;

                let mut env = match self.state.get_environment(&env_id) {
                    Ok(Some(env)) => env,
                    _ => return,
                };
                if !matches!(env.status, EnvStatus::Creating | EnvStatus::Starting) {
                    debug!(%env_id, status = %env.status, "ready poll abandoned");
                    return;
                }

                let cluster_id = match env.cluster_id.clone() {
                    Some(c) => c,
                    None => {
                        self.mark_error_locked(env, "no cluster assigned".into(), release_on_fail)
                            .await;
                        return;
                    }
                };

                if let Ok(client) = self.registry.client(&cluster_id).await {
                    let phase =
                        tokio::time::timeout(self.retry.call_timeout, client.workload_phase(&env_id))
                            .await;
                    match phase {
                        Ok(Ok(WorkloadPhase::Ready)) => {
                            env.status = EnvStatus::Running;
                            env.error = None;
                            env.last_active_at = epoch_secs();
                            if let Err(e) = self.state.put_environment(&env) {
                                warn!(%env_id, error = %e, "failed to persist running status");
                            } else {
                                info!(%env_id, "environment running");
                            }
                            return;
                        }
                        Ok(Ok(WorkloadPhase::Failed { reason })) => {
                            self.mark_error_locked(env, reason, release_on_fail).await;
                            return;
                        }
                        Ok(Ok(WorkloadPhase::Pending | WorkloadPhase::Absent)) => {}
                        Ok(Err(e)) if e.is_transient() => {
                            debug!(%env_id, error = %e, "transient fault during ready poll");
                        }
                        Ok(Err(e)) => {
                            self.mark_error_locked(env, e.to_string(), release_on_fail)
                                .await;
                            return;
                        }
                        Err(_) => {
                            debug!(%env_id, "workload phase query timed out");
                        }
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                self.fail_provisioning(
                    &env_id,
                    "provisioning deadline exceeded".to_string(),
                    release_on_fail,
                )
                .await;
                return;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Record a provisioning fault, taking the environment lock first.
    async fn fail_provisioning(&self, env_id: &str, reason: String, release_slot: bool) {
        let lock = self.env_locks.get(env_id).await;
        let _guard = lock.lock_owned().await;
        if let Ok(Some(env)) = self.state.get_environment(env_id) {
            if matches!(env.status, EnvStatus::Creating | EnvStatus::Starting) {
                self.mark_error_locked(env, reason, release_slot).await;
            }
        }
    }

    /// Move a record to `Error` with the fault recorded. Caller must hold
    /// the environment lock.
    async fn mark_error_locked(
        &self,
        mut env: EnvironmentRecord,
        reason: String,
        release_slot: bool,
    ) {
        if !transition_allowed(env.status, EnvStatus::Error) {
            warn!(env_id = %env.id, from = %env.status, "cannot record error from this status");
            return;
        }
        warn!(env_id = %env.id, %reason, "environment moved to error");
        env.status = EnvStatus::Error;
        env.error = Some(reason);

        if release_slot && !env.capacity_released {
            if let Some(cluster_id) = &env.cluster_id {
                if let Err(e) = self.registry.release_slot(cluster_id).await {
                    warn!(env_id = %env.id, error = %e, "failed to release capacity slot");
                } else {
                    env.capacity_released = true;
                }
            }
        }

        if let Err(e) = self.state.put_environment(&env) {
            warn!(env_id = %env.id, error = %e, "failed to persist error status");
        }
    }

    // ── Stop / Start / Restart ─────────────────────────────────────

    /// Scale the workload to zero, preserving the volume.
    ///
    /// Idempotent: stopping a stopped environment returns it unchanged
    /// without a cluster call.
    pub async fn stop(&self, user_id: &str, env_id: &str) -> OrchestratorResult<EnvironmentRecord> {
        let lock = self.env_locks.get(env_id).await;
        let _guard = lock.lock_owned().await;

        let mut env = self.owned_environment(user_id, env_id)?;
        if env.status == EnvStatus::Stopped || env.status == EnvStatus::Stopping {
            return Ok(env);
        }
        if !transition_allowed(env.status, EnvStatus::Stopping) {
            return Err(OrchestratorError::InvalidTransition {
                from: env.status,
                to: EnvStatus::Stopping,
            });
        }

        env.status = EnvStatus::Stopping;
        self.state.put_environment(&env)?;

        match self.scale(&env, 0).await {
            Ok(()) => {
                env.status = EnvStatus::Stopped;
                self.state.put_environment(&env)?;
                info!(%env_id, "environment stopped");
                Ok(env)
            }
            Err(e) => {
                let reason = e.to_string();
                self.mark_error_locked(env, reason, false).await;
                Err(e.into())
            }
        }
    }

    /// Scale the workload back to one replica.
    ///
    /// Idempotent from `Running`/`Starting`; only valid otherwise from
    /// `Stopped`. Returns the record in `Starting`; a ready poll drives
    /// it to `Running`.
    pub async fn start(&self, user_id: &str, env_id: &str) -> OrchestratorResult<EnvironmentRecord> {
        let lock = self.env_locks.get(env_id).await;
        let _guard = lock.lock_owned().await;

        let mut env = self.owned_environment(user_id, env_id)?;
        if env.status == EnvStatus::Running || env.status == EnvStatus::Starting {
            return Ok(env);
        }
        if env.status != EnvStatus::Stopped {
            return Err(OrchestratorError::InvalidTransition {
                from: env.status,
                to: EnvStatus::Starting,
            });
        }

        env.status = EnvStatus::Starting;
        self.state.put_environment(&env)?;

        match self.scale(&env, 1).await {
            Ok(()) => {
                let this = self.clone();
                let env_id = env_id.to_string();
                tokio::spawn(async move {
                    this.ready_poll(env_id, false).await;
                });
                info!(env_id = %env.id, "environment starting");
                Ok(env)
            }
            Err(e) => {
                let reason = e.to_string();
                self.mark_error_locked(env, reason, false).await;
                Err(e.into())
            }
        }
    }

    /// Re-issue the start sequence, clearing any recorded fault.
    ///
    /// Valid from `Running`, `Stopped`, or `Error`.
    pub async fn restart(
        &self,
        user_id: &str,
        env_id: &str,
    ) -> OrchestratorResult<EnvironmentRecord> {
        let lock = self.env_locks.get(env_id).await;
        let _guard = lock.lock_owned().await;

        let mut env = self.owned_environment(user_id, env_id)?;
        if !matches!(
            env.status,
            EnvStatus::Running | EnvStatus::Stopped | EnvStatus::Error
        ) {
            return Err(OrchestratorError::InvalidTransition {
                from: env.status,
                to: EnvStatus::Starting,
            });
        }

        env.status = EnvStatus::Starting;
        env.error = None;
        self.state.put_environment(&env)?;

        match self.scale(&env, 1).await {
            Ok(()) => {
                let this = self.clone();
                let env_id = env_id.to_string();
                tokio::spawn(async move {
                    this.ready_poll(env_id, false).await;
                });
                info!(env_id = %env.id, "environment restarting");
                Ok(env)
            }
            Err(e) => {
                let reason = e.to_string();
                self.mark_error_locked(env, reason, false).await;
                Err(e.into())
            }
        }
    }

    async fn scale(
        &self,
        env: &EnvironmentRecord,
        replicas: u32,
    ) -> Result<(), devgrid_cluster::ClusterApiError> {
        let cluster_id = env.cluster_id.clone().ok_or_else(|| {
            devgrid_cluster::ClusterApiError::Invalid("no cluster assigned".to_string())
        })?;
        let client = self.registry.client(&cluster_id).await.map_err(|e| {
            devgrid_cluster::ClusterApiError::Unavailable(format!("cluster client: {e}"))
        })?;

        let env_id = env.id.clone();
        self.retry
            .call("scale_workload", move || {
                let client = client.clone();
                let env_id = env_id.clone();
                async move { client.scale_workload(&env_id, replicas).await }
            })
            .await
    }

    // ── Delete ─────────────────────────────────────────────────────

    /// Tear the environment down and mark it terminated.
    ///
    /// Waits for any in-flight operation's lock; teardown is best-effort
    /// (faults are logged, never block the terminal transition). Safe to
    /// call from `Error` and idempotent once terminated.
    pub async fn delete(
        &self,
        user_id: &str,
        env_id: &str,
    ) -> OrchestratorResult<EnvironmentRecord> {
        let lock = self.env_locks.get(env_id).await;
        let _guard = lock.lock_owned().await;

        let mut env = self.owned_environment(user_id, env_id)?;
        if env.status == EnvStatus::Terminated {
            return Ok(env);
        }

        if env.status != EnvStatus::Terminating {
            // All live states admit this edge.
            env.status = EnvStatus::Terminating;
            self.state.put_environment(&env)?;
        }

        if let Some(cluster_id) = env.cluster_id.clone() {
            match self.registry.client(&cluster_id).await {
                Ok(client) => {
                    self.teardown(&client, env_id).await;
                }
                Err(e) => {
                    warn!(%env_id, error = %e, "teardown skipped, cluster client unavailable");
                }
            }
            if !env.capacity_released {
                if let Err(e) = self.registry.release_slot(&cluster_id).await {
                    warn!(%env_id, error = %e, "failed to release capacity slot");
                } else {
                    env.capacity_released = true;
                }
            }
        }

        env.status = EnvStatus::Terminated;
        self.state.put_environment(&env)?;
        info!(%env_id, "environment terminated");
        Ok(env)
    }

    /// Best-effort deletion of workload, entrypoint, and volume.
    async fn teardown(&self, client: &Arc<dyn ClusterApi>, env_id: &str) {
        {
            let client = client.clone();
            let id = env_id.to_string();
            let result = self
                .retry
                .call("delete_workload", move || {
                    let client = client.clone();
                    let id = id.clone();
                    async move { client.delete_workload(&id).await }
                })
                .await;
            if let Err(e) = result {
                warn!(%env_id, error = %e, "workload teardown failed, continuing");
            }
        }
        {
            let client = client.clone();
            let id = env_id.to_string();
            let result = self
                .retry
                .call("delete_entrypoint", move || {
                    let client = client.clone();
                    let id = id.clone();
                    async move { client.delete_entrypoint(&id).await }
                })
                .await;
            if let Err(e) = result {
                warn!(%env_id, error = %e, "entrypoint teardown failed, continuing");
            }
        }
        {
            let client = client.clone();
            let id = env_id.to_string();
            let result = self
                .retry
                .call("delete_volume", move || {
                    let client = client.clone();
                    let id = id.clone();
                    async move { client.delete_volume(&id).await }
                })
                .await;
            if let Err(e) = result {
                warn!(%env_id, error = %e, "volume teardown failed, continuing");
            }
        }
    }

    // ── Activity ───────────────────────────────────────────────────

    /// Record terminal activity on an environment (relay heartbeats).
    pub async fn record_activity(&self, env_id: &str) -> OrchestratorResult<()> {
        let lock = self.env_locks.get(env_id).await;
        let _guard = lock.lock_owned().await;
        if let Some(mut env) = self.state.get_environment(env_id)? {
            env.last_active_at = epoch_secs();
            self.state.put_environment(&env)?;
        }
        Ok(())
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn owned_environment(
        &self,
        user_id: &str,
        env_id: &str,
    ) -> OrchestratorResult<EnvironmentRecord> {
        match self.state.get_environment(env_id)? {
            Some(env) if env.user_id == user_id => Ok(env),
            // Hide other users' environments entirely.
            _ => Err(OrchestratorError::EnvironmentNotFound(env_id.to_string())),
        }
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
