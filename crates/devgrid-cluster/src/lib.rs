//! devgrid-cluster — the cluster registry and the cluster API seam.
//!
//! Holds everything DevGrid knows about registered compute clusters:
//! sealed connection credentials, threshold-driven health state, soft
//! capacity accounting, and the selection policy that places new
//! environments. The cluster orchestration API itself is an external
//! collaborator, modeled as the [`ClusterApi`] trait; connectors turn a
//! resolved credential into a live client.
//!
//! # Architecture
//!
//! ```text
//! ClusterRegistry
//!   ├── StateStore (ClusterRecord read/write-through)
//!   ├── ClusterConnector (credential → Arc<dyn ClusterApi>, cached)
//!   ├── HealthTracker per cluster (consecutive-failure thresholds)
//!   └── capacity lock (soft slot counters, no oversubscription)
//! HealthMonitor
//!   └── per-cluster background ping loop
//! ```

pub mod api;
pub mod credential;
pub mod error;
pub mod health;
pub mod registry;

pub use api::{
    ApiResult, ClusterApi, ClusterApiError, ClusterConnector, ExecInput, ExecStream, Utilization,
    WorkloadPhase, WorkloadSpec,
};
pub use credential::{open_credential, seal_credential};
pub use error::{RegistryError, RegistryResult};
pub use health::{HealthMonitor, HealthTracker};
pub use registry::{ClusterRegistry, RegionAvailability};
