//! devgrid-state — embedded document store for DevGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for environments, clusters, terminal sessions, and metric samples.
//!
//! # Architecture
//!
//! All document types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{user_id}/{env_id}` is avoided — environments key on
//! their uuid, with user lookups as filtered scans; metric samples key on
//! `{environment_id}:{sampled_at}`) enable prefix scans for time-series
//! queries and per-parent deletes.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Metric samples have no native TTL
//! in redb; `purge_metrics_before` implements the retention expiry and is
//! driven by the metrics sampler.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
