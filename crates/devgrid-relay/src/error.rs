//! Relay error types.

use devgrid_state::EnvStatus;
use thiserror::Error;

/// Errors surfaced when opening or driving a terminal session.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("environment not ready: status is {status}")]
    EnvironmentNotReady { status: EnvStatus },

    #[error("forbidden")]
    Forbidden,

    #[error("exec stream failed: {0}")]
    ExecFailed(String),

    #[error("registry error: {0}")]
    Registry(#[from] devgrid_cluster::RegistryError),

    #[error("state store error: {0}")]
    State(#[from] devgrid_state::StateError),
}

pub type RelayResult<T> = Result<T, RelayError>;
