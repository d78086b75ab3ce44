//! Resource quota policy.
//!
//! Pure mapping from subscription tier to concurrency and resource
//! ceilings, plus the check Create runs before touching any cluster.
//! Aggregate ceilings are the tier's per-environment preset multiplied
//! by its concurrency limit.

use devgrid_core::SubscriptionTier;
use devgrid_state::{EnvironmentRecord, ResourceAllocation};

/// Ceilings for one tier: concurrent environments plus aggregate
/// CPU/memory/storage across all non-terminated environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub max_environments: u32,
    pub cpu_millis: u32,
    pub memory_mib: u64,
    pub storage_gib: u64,
}

/// Default per-environment allocation for a tier.
pub fn default_allocation(tier: SubscriptionTier) -> ResourceAllocation {
    match tier {
        SubscriptionTier::Free => ResourceAllocation {
            cpu_millis: 500,
            memory_mib: 512,
            storage_gib: 5,
        },
        SubscriptionTier::Starter => ResourceAllocation {
            cpu_millis: 1000,
            memory_mib: 2048,
            storage_gib: 10,
        },
        SubscriptionTier::Pro => ResourceAllocation {
            cpu_millis: 2000,
            memory_mib: 4096,
            storage_gib: 20,
        },
        SubscriptionTier::Admin => ResourceAllocation {
            cpu_millis: 4000,
            memory_mib: 8192,
            storage_gib: 50,
        },
    }
}

/// Ceilings for a tier.
pub fn limits_for(tier: SubscriptionTier) -> QuotaLimits {
    let per_env = default_allocation(tier);
    let count = match tier {
        SubscriptionTier::Free => 1,
        SubscriptionTier::Starter => 3,
        SubscriptionTier::Pro => 10,
        SubscriptionTier::Admin => 100,
    };
    QuotaLimits {
        max_environments: count,
        cpu_millis: per_env.cpu_millis * count,
        memory_mib: per_env.memory_mib * u64::from(count),
        storage_gib: per_env.storage_gib * u64::from(count),
    }
}

/// Check whether adding `requested` on top of the user's existing
/// non-terminated environments stays under the tier's ceilings.
///
/// Returns a human-readable violation, or `None` if the request fits.
pub fn check_quota(
    limits: QuotaLimits,
    existing: &[EnvironmentRecord],
    requested: ResourceAllocation,
) -> Option<String> {
    let active: Vec<&EnvironmentRecord> =
        existing.iter().filter(|e| e.status.is_active()).collect();

    if active.len() as u32 >= limits.max_environments {
        return Some(format!(
            "environment limit reached ({} of {})",
            active.len(),
            limits.max_environments
        ));
    }

    let cpu: u32 = active.iter().map(|e| e.resources.cpu_millis).sum();
    let memory: u64 = active.iter().map(|e| e.resources.memory_mib).sum();
    let storage: u64 = active.iter().map(|e| e.resources.storage_gib).sum();

    if cpu + requested.cpu_millis > limits.cpu_millis {
        return Some(format!(
            "cpu ceiling exceeded ({}m of {}m)",
            cpu + requested.cpu_millis,
            limits.cpu_millis
        ));
    }
    if memory + requested.memory_mib > limits.memory_mib {
        return Some(format!(
            "memory ceiling exceeded ({}Mi of {}Mi)",
            memory + requested.memory_mib,
            limits.memory_mib
        ));
    }
    if storage + requested.storage_gib > limits.storage_gib {
        return Some(format!(
            "storage ceiling exceeded ({}Gi of {}Gi)",
            storage + requested.storage_gib,
            limits.storage_gib
        ));
    }

    None
}
