//! devgrid-core — shared leaf types for DevGrid.
//!
//! Holds the daemon configuration (devgrid.toml), the resolved principal
//! handed in by the identity collaborator, and the subscription tiers the
//! quota policy maps over. No I/O beyond config file loading; every other
//! crate in the workspace depends on this one.

pub mod config;
pub mod principal;

pub use config::DevGridConfig;
pub use principal::{Principal, SubscriptionTier};
