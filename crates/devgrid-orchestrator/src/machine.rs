//! The environment lifecycle transition table.
//!
//! A closed set of edges consulted at the single serialization point
//! (the per-environment lock). `Terminated` is absorbing; `Terminating`
//! is reachable from every live state so deletion is always possible,
//! error cleanup included.

use devgrid_state::EnvStatus;

/// Whether the edge `from -> to` exists in the lifecycle graph.
pub fn transition_allowed(from: EnvStatus, to: EnvStatus) -> bool {
    use EnvStatus::*;
    matches!(
        (from, to),
        (Creating, Running)
            | (Creating, Error)
            | (Creating, Terminating)
            | (Running, Stopping)
            | (Running, Starting) // restart
            | (Running, Terminating)
            | (Stopping, Stopped)
            | (Stopping, Error)
            | (Stopping, Terminating)
            | (Stopped, Starting)
            | (Stopped, Terminating)
            | (Starting, Running)
            | (Starting, Error)
            | (Starting, Terminating)
            | (Error, Starting) // restart clears the fault and re-runs start
            | (Error, Terminating)
            | (Terminating, Terminated)
    )
}
