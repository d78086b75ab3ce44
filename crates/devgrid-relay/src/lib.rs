//! devgrid-relay — bidirectional terminal access into environments.
//!
//! For each accepted terminal connection the relay authenticates the
//! caller against the owning environment, opens an exec stream into the
//! workload on its assigned cluster, and runs two I/O pumps until either
//! side closes or the idle sweep reaps the session.
//!
//! # Architecture
//!
//! ```text
//! Relay
//!   ├── StateStore (SessionRecord write-through; in-memory map is a cache)
//!   ├── ClusterRegistry (exec streams via the cluster API)
//!   ├── Orchestrator (environment activity touches)
//!   ├── per-session TokenBucket (input frame rate limiting)
//!   ├── inbound pump  (client frames → exec stream)
//!   ├── outbound pump (exec stream → output frames)
//!   └── idle sweep    (reaps sessions past the heartbeat timeout)
//! ```
//!
//! The wire protocol is a tagged JSON frame (`frame::Frame`); the relay
//! itself only ever sees frames, never sockets — the caller-facing
//! transport pumps its connection into the [`TerminalChannel`] returned
//! by `Relay::open`.

pub mod bucket;
pub mod error;
pub mod frame;
pub mod relay;

pub use bucket::TokenBucket;
pub use error::{RelayError, RelayResult};
pub use frame::Frame;
pub use relay::{Relay, TerminalChannel};
