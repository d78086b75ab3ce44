//! devgrid-orchestrator — the environment lifecycle engine.
//!
//! Owns the environment state machine and every operation that moves an
//! environment through it: Create, Stop, Start, Delete, Restart. The
//! orchestrator talks to the cluster registry to place environments and
//! to the chosen cluster's orchestration API to provision and tear down
//! workloads, entrypoints, and volumes.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator
//!   ├── StateStore (EnvironmentRecord write-through)
//!   ├── ClusterRegistry (selection, capacity slots, API clients)
//!   ├── per-environment lock (serializes every state transition)
//!   ├── per-user lock (serializes Create for name uniqueness)
//!   ├── RetryPolicy (bounded exponential backoff + call timeouts)
//!   └── ready-poll task per in-flight provisioning operation
//! ```
//!
//! Quota enforcement is a pure policy (`quota`); the transition table is
//! a closed function (`machine`) consulted only while the environment's
//! lock is held, so illegal interleavings cannot produce impossible
//! states.

pub mod error;
pub mod machine;
pub mod orchestrator;
pub mod quota;
pub mod retry;

pub use error::{OrchestratorError, OrchestratorResult};
pub use machine::transition_allowed;
pub use orchestrator::Orchestrator;
pub use quota::{QuotaLimits, default_allocation, limits_for};
pub use retry::RetryPolicy;
