//! The authority store: source of truth for guild configuration, role ranks
//! and entity status.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::models::{EntityStatus, GuildPermissionProfile, ProfileUpdate, RoleRankAssignment};
use crate::cache::{EntityId, GuildId, RoleId};
use crate::error::{AuthzError, Result};

/// Persistence collaborator read by the caches.
///
/// Writes go through [`crate::Authority`], which invalidates the affected
/// cache entries before reporting success.
#[async_trait]
pub trait AuthorityStore: Send + Sync {
    /// Stored profile, or an empty one if the guild has none.
    async fn fetch_guild_profile(&self, guild_id: GuildId) -> Result<GuildPermissionProfile>;

    async fn fetch_role_assignments(&self, guild_id: GuildId) -> Result<Vec<RoleRankAssignment>>;

    /// Stored status, or the default flag if the entity has none.
    async fn fetch_entity_status(
        &self,
        guild_id: GuildId,
        entity_id: EntityId,
    ) -> Result<EntityStatus>;

    /// Every guild with stored configuration or rank assignments.
    async fn known_guilds(&self) -> Result<Vec<GuildId>>;

    /// Apply a partial profile update and return the stored result.
    async fn update_guild_profile(
        &self,
        guild_id: GuildId,
        update: &ProfileUpdate,
    ) -> Result<GuildPermissionProfile>;

    async fn upsert_role_rank(&self, assignment: &RoleRankAssignment) -> Result<()>;

    /// Returns whether an assignment existed.
    async fn delete_role_rank(&self, guild_id: GuildId, role_id: RoleId) -> Result<bool>;

    async fn replace_role_ranks(
        &self,
        guild_id: GuildId,
        assignments: &[RoleRankAssignment],
    ) -> Result<()>;

    /// Store `status`, or remove the stored status when `None`.
    async fn save_entity_status(
        &self,
        guild_id: GuildId,
        entity_id: EntityId,
        status: Option<EntityStatus>,
    ) -> Result<()>;
}

/// Run a store call under `timeout`, reporting expiry as `StoreUnavailable`.
pub async fn with_timeout<T, F>(operation: &'static str, timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(AuthzError::store(
            operation,
            format!("timed out after {}ms", timeout.as_millis()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_store_unavailable() {
        let result: Result<()> = with_timeout("fetch_role_assignments", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;

        match result {
            Err(AuthzError::StoreUnavailable { operation, reason }) => {
                assert_eq!(operation, "fetch_role_assignments");
                assert!(reason.contains("10ms"));
            }
            other => panic!("expected StoreUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_passes_result_through() {
        let result = with_timeout("op", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }
}
