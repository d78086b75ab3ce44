//! Registry error types.

use thiserror::Error;

/// Errors that can occur in the cluster registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    #[error("no available cluster")]
    NoAvailableCluster,

    #[error("credential error: {0}")]
    Credential(String),

    #[error("connector error: {0}")]
    Connect(String),

    #[error("state store error: {0}")]
    State(#[from] devgrid_state::StateError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
