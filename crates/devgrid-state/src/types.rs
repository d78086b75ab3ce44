//! Document types for the DevGrid store.
//!
//! These types represent the persisted state of environments, clusters,
//! terminal sessions, and metric samples. All types are serializable
//! to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Unique identifier for an environment (uuid).
pub type EnvironmentId = String;

/// Unique identifier for a registered cluster.
pub type ClusterId = String;

/// Unique identifier for a terminal connection (uuid).
pub type ConnectionId = String;

// ── Environment ───────────────────────────────────────────────────

/// Lifecycle status of an environment.
///
/// Transitions are validated by the orchestrator's transition table;
/// `Terminated` is absorbing and doubles as the soft-delete marker
/// (records are retained for audit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvStatus {
    Creating,
    Running,
    Stopping,
    Stopped,
    Starting,
    Terminating,
    Terminated,
    Error,
}

impl EnvStatus {
    /// Whether this environment still counts toward quota and cluster
    /// capacity. Everything short of `Terminated` does.
    pub fn is_active(self) -> bool {
        self != EnvStatus::Terminated
    }
}

impl std::fmt::Display for EnvStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnvStatus::Creating => "creating",
            EnvStatus::Running => "running",
            EnvStatus::Stopping => "stopping",
            EnvStatus::Stopped => "stopped",
            EnvStatus::Starting => "starting",
            EnvStatus::Terminating => "terminating",
            EnvStatus::Terminated => "terminated",
            EnvStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Resource allocation for one environment.
///
/// Storage is immutable after creation; resize is not supported.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceAllocation {
    /// CPU in millicores (500 = half a core).
    pub cpu_millis: u32,
    /// Memory in MiB.
    pub memory_mib: u64,
    /// Persistent volume size in GiB.
    pub storage_gib: u64,
}

/// A persisted development environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentRecord {
    pub id: EnvironmentId,
    pub user_id: String,
    /// Human name, unique per user among non-terminated records.
    pub name: String,
    /// Template reference (catalog CRUD is out of core scope).
    pub template: String,
    /// Assigned cluster; always `Some` once past `Creating`.
    pub cluster_id: Option<ClusterId>,
    pub status: EnvStatus,
    pub resources: ResourceAllocation,
    /// Cluster-side workload name, derived from the environment id.
    pub workload: String,
    /// Cluster-side network entrypoint name.
    pub entrypoint: String,
    /// Cluster-side persistent volume name.
    pub volume: String,
    /// Unix timestamp (seconds) of creation.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last observed activity.
    pub last_active_at: u64,
    /// Fault detail recorded when status is `Error`.
    pub error: Option<String>,
    /// Whether this environment's cluster capacity slot has already been
    /// given back (terminal provisioning failure or deletion). Guards
    /// against double release.
    pub capacity_released: bool,
}

// ── Cluster ───────────────────────────────────────────────────────

/// Health status of a registered cluster, driven by the health loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterHealth {
    Healthy,
    Degraded,
    Unreachable,
}

/// An opaque connection credential as delivered by the administrative
/// plane: base64 payload plus a sha256 fingerprint checked on resolve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealedCredential {
    pub payload: String,
    pub fingerprint: String,
}

/// A registered compute cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterRecord {
    pub id: ClusterId,
    pub name: String,
    /// Region tag, matched against a principal's preferred region.
    pub region: String,
    pub health: ClusterHealth,
    pub credential: SealedCredential,
    /// Soft capacity: maximum concurrent environments.
    pub capacity: u32,
    /// Soft counter of environments currently claiming a slot.
    pub active_environments: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ClusterRecord {
    /// Whether this cluster has a spare capacity slot.
    pub fn has_capacity(&self) -> bool {
        self.active_environments < self.capacity
    }
}

// ── Terminal session ──────────────────────────────────────────────

/// Durable record of a terminal session.
///
/// The in-memory relay map is a cache of these records, written through
/// on every mutation; after a process restart the records are the only
/// source of truth and any still marked live belong to a dead process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub connection_id: ConnectionId,
    pub environment_id: EnvironmentId,
    pub user_id: String,
    /// Unix timestamp (seconds) when the connection was accepted.
    pub opened_at: u64,
    /// Unix timestamp (milliseconds) of the last heartbeat or input.
    pub last_heartbeat_at: u64,
    pub live: bool,
}

// ── Metric sample ─────────────────────────────────────────────────

/// Point-in-time resource utilization for one environment. Append-only;
/// samples past the retention window are purged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub environment_id: EnvironmentId,
    /// Unix timestamp (seconds) the sample was taken.
    pub sampled_at: u64,
    /// CPU utilization in millicores.
    pub cpu_millis: u32,
    /// Memory utilization in MiB.
    pub memory_mib: u64,
    /// Volume utilization in GiB.
    pub storage_gib: u64,
}

impl MetricSample {
    /// Composite key for the metrics table. The timestamp is zero-padded
    /// so a prefix scan yields samples in time order.
    pub fn table_key(&self) -> String {
        metric_key(&self.environment_id, self.sampled_at)
    }
}

/// Build a metrics table key from its parts.
pub fn metric_key(environment_id: &str, sampled_at: u64) -> String {
    format!("{environment_id}:{sampled_at:020}")
}
