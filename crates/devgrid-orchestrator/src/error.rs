//! Orchestrator error types.

use devgrid_cluster::{ClusterApiError, RegistryError};
use devgrid_state::EnvStatus;
use thiserror::Error;

/// Errors surfaced by environment lifecycle operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("environment name already in use: {0}")]
    NameConflict(String),

    #[error("no available cluster")]
    NoAvailableCluster,

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: EnvStatus, to: EnvStatus },

    #[error("environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterApiError),

    #[error("registry error: {0}")]
    Registry(RegistryError),

    #[error("state store error: {0}")]
    State(#[from] devgrid_state::StateError),
}

impl From<RegistryError> for OrchestratorError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NoAvailableCluster => OrchestratorError::NoAvailableCluster,
            other => OrchestratorError::Registry(other),
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
