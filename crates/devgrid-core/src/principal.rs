//! Resolved principals and subscription tiers.
//!
//! Authentication happens upstream; the core only ever sees a resolved
//! principal carrying the user id, tier, optional preferred region, and
//! the admin claim.

use serde::{Deserialize, Serialize};

/// Subscription tier, as claimed by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    Starter,
    Pro,
    Admin,
}

/// A resolved caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub tier: SubscriptionTier,
    /// Region tag the user prefers environments to land in, if declared.
    pub preferred_region: Option<String>,
    pub is_admin: bool,
}

impl Principal {
    /// A plain user principal with the given tier and no region preference.
    pub fn user(user_id: impl Into<String>, tier: SubscriptionTier) -> Self {
        Self {
            user_id: user_id.into(),
            tier,
            preferred_region: None,
            is_admin: false,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.preferred_region = Some(region.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_serializes_snake_case() {
        let json = serde_json::to_string(&SubscriptionTier::Starter).unwrap();
        assert_eq!(json, "\"starter\"");
    }

    #[test]
    fn principal_builder() {
        let p = Principal::user("u-1", SubscriptionTier::Free).with_region("eu-west");
        assert_eq!(p.user_id, "u-1");
        assert_eq!(p.preferred_region.as_deref(), Some("eu-west"));
        assert!(!p.is_admin);
    }
}
