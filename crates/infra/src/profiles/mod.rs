//! User profile lookups (live retention tier).

#[cfg(feature = "redis")]
mod redis;

use std::collections::HashMap;
use std::sync::RwLock;

use gas_core::{RetentionTier, UserId};

#[cfg(feature = "redis")]
pub use self::redis::RedisProfiles;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProfileError {
    #[error("unknown user: {0}")]
    UnknownUser(UserId),

    #[error("user {user_id} has unrecognised role '{role}'")]
    InvalidRole { user_id: UserId, role: String },

    #[error("profile backend error: {0}")]
    Backend(String),
}

pub trait ProfileDirectory: Send + Sync {
    /// Current retention tier of a user.
    fn retention_tier(&self, user_id: &UserId) -> Result<RetentionTier, ProfileError>;
}

impl<P> ProfileDirectory for std::sync::Arc<P>
where
    P: ProfileDirectory + ?Sized,
{
    fn retention_tier(&self, user_id: &UserId) -> Result<RetentionTier, ProfileError> {
        (**self).retention_tier(user_id)
    }
}

/// In-memory profile directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryProfiles {
    tiers: RwLock<HashMap<UserId, RetentionTier>>,
}

impl InMemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tier(&self, user_id: UserId, tier: RetentionTier) {
        if let Ok(mut tiers) = self.tiers.write() {
            tiers.insert(user_id, tier);
        }
    }
}

impl ProfileDirectory for InMemoryProfiles {
    fn retention_tier(&self, user_id: &UserId) -> Result<RetentionTier, ProfileError> {
        let tiers = self
            .tiers
            .read()
            .map_err(|_| ProfileError::Backend("profile lock poisoned".to_string()))?;
        tiers
            .get(user_id)
            .copied()
            .ok_or_else(|| ProfileError::UnknownUser(user_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_changes_are_visible_immediately() {
        let profiles = InMemoryProfiles::new();
        let user = UserId::new("u1").unwrap();
        assert!(matches!(profiles.retention_tier(&user), Err(ProfileError::UnknownUser(_))));

        profiles.set_tier(user.clone(), RetentionTier::Free);
        assert_eq!(profiles.retention_tier(&user).unwrap(), RetentionTier::Free);

        profiles.set_tier(user.clone(), RetentionTier::Premium);
        assert_eq!(profiles.retention_tier(&user).unwrap(), RetentionTier::Premium);
    }
}
