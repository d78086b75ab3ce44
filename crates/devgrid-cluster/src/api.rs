//! The cluster orchestration API collaborator.
//!
//! Every call is keyed by the environment id and designed to be
//! idempotent: creating a resource that already exists and deleting one
//! that is already gone both succeed. Errors are split into transient
//! faults (eligible for retry with backoff) and terminal ones.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use devgrid_state::{ClusterRecord, ResourceAllocation};

/// Errors surfaced by a cluster API client.
#[derive(Debug, Error)]
pub enum ClusterApiError {
    #[error("cluster call timed out: {0}")]
    Timeout(String),

    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    #[error("request denied by cluster: {0}")]
    Denied(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("not found on cluster: {0}")]
    NotFound(String),
}

impl ClusterApiError {
    /// Transient faults are retried with bounded exponential backoff;
    /// everything else is terminal for the attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterApiError::Timeout(_) | ClusterApiError::Unavailable(_))
    }
}

pub type ApiResult<T> = Result<T, ClusterApiError>;

/// What the orchestrator asks the cluster to run for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub environment_id: String,
    /// Image reference resolved from the template.
    pub image: String,
    pub resources: ResourceAllocation,
}

/// Observed lifecycle phase of a workload on the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadPhase {
    /// Scheduled but not yet serving.
    Pending,
    /// Up and accepting exec streams.
    Ready,
    /// The cluster gave up on it (image pull failure, scheduling failure).
    Failed { reason: String },
    /// No such workload exists.
    Absent,
}

/// Current resource utilization of a running workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utilization {
    pub cpu_millis: u32,
    pub memory_mib: u64,
    pub storage_gib: u64,
}

/// Input side of an exec stream: raw bytes or a terminal geometry change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecInput {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
}

/// A bidirectional byte stream attached to a workload's terminal.
///
/// The output channel closing means the remote process exited or the
/// cluster tore the stream down; dropping the input sender closes the
/// stream from our side.
pub struct ExecStream {
    pub input: mpsc::Sender<ExecInput>,
    pub output: mpsc::Receiver<Vec<u8>>,
}

/// The cluster's orchestration API, as consumed by the core.
///
/// Implementations wrap whatever the cluster actually speaks; tests use
/// an in-memory fake. All calls suspend the issuing task only.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create the persistent volume for an environment.
    async fn create_volume(&self, environment_id: &str, storage_gib: u64) -> ApiResult<()>;

    /// Create the workload backing an environment.
    async fn create_workload(&self, spec: &WorkloadSpec) -> ApiResult<()>;

    /// Create the network entrypoint for an environment.
    async fn create_entrypoint(&self, environment_id: &str) -> ApiResult<()>;

    /// Scale the workload to the given replica count (0 = stopped).
    async fn scale_workload(&self, environment_id: &str, replicas: u32) -> ApiResult<()>;

    async fn delete_workload(&self, environment_id: &str) -> ApiResult<()>;

    async fn delete_entrypoint(&self, environment_id: &str) -> ApiResult<()>;

    async fn delete_volume(&self, environment_id: &str) -> ApiResult<()>;

    /// Observe the workload's current phase.
    async fn workload_phase(&self, environment_id: &str) -> ApiResult<WorkloadPhase>;

    /// Attach an exec stream to the running workload.
    async fn open_exec(&self, environment_id: &str) -> ApiResult<ExecStream>;

    /// Query current resource utilization.
    async fn utilization(&self, environment_id: &str) -> ApiResult<Utilization>;

    /// Liveness probe used by the health monitor.
    async fn ping(&self) -> ApiResult<()>;
}

impl std::fmt::Debug for dyn ClusterApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClusterApi")
    }
}

/// Builds a live [`ClusterApi`] client from a cluster record and its
/// resolved (unsealed) credential bytes.
pub trait ClusterConnector: Send + Sync {
    fn connect(
        &self,
        cluster: &ClusterRecord,
        credential: &[u8],
    ) -> anyhow::Result<Arc<dyn ClusterApi>>;
}
