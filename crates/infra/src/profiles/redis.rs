use std::sync::Arc;

use redis::Commands;

use gas_core::{RetentionTier, UserId};

use super::{ProfileDirectory, ProfileError};

/// Profiles stored as Redis hashes: `<namespace>:profile:<user_id>` with a
/// `role` field holding `free_user` or `premium_user`.
#[derive(Debug, Clone)]
pub struct RedisProfiles {
    client: Arc<redis::Client>,
    namespace: String,
}

impl RedisProfiles {
    pub fn from_client(client: Arc<redis::Client>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

impl ProfileDirectory for RedisProfiles {
    fn retention_tier(&self, user_id: &UserId) -> Result<RetentionTier, ProfileError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| ProfileError::Backend(e.to_string()))?;

        let key = format!("{}:profile:{user_id}", self.namespace);
        let role: Option<String> = conn
            .hget(&key, "role")
            .map_err(|e| ProfileError::Backend(e.to_string()))?;

        let role = role.ok_or_else(|| ProfileError::UnknownUser(user_id.clone()))?;
        role.parse().map_err(|_| ProfileError::InvalidRole {
            user_id: user_id.clone(),
            role,
        })
    }
}
