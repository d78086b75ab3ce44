//! redb table definitions for the DevGrid document store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized document
//! types). Metric samples use the composite pattern
//! `{environment_id}:{sampled_at:020}` so a prefix scan yields a
//! time-ordered series.

use redb::TableDefinition;

/// Environment records keyed by `{environment_id}`.
pub const ENVIRONMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("environments");

/// Cluster records keyed by `{cluster_id}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Terminal session records keyed by `{connection_id}`.
pub const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Metric samples keyed by `{environment_id}:{sampled_at:020}`.
pub const METRICS: TableDefinition<&str, &[u8]> = TableDefinition::new("metrics");
