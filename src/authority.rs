//! Process-wide permission state.
//!
//! [`Authority`] owns the caches, the resolver and the pre-warm coordinator,
//! and is the only place that writes to the authority store. Every write
//! invalidates the affected cache entries before it returns, so a check that
//! starts after the write acknowledges sees the new state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::cache::{
    BackendFactory, EntityId, EntityStatusCache, GuildConfigCache, GuildId, Rank, RoleId,
    SharedConnection, UserId, validate_id,
};
use crate::config::{BackendKind, Config};
use crate::database::store::with_timeout;
use crate::database::{
    AuthorityStore, Database, EntityStatus, GuildPermissionProfile, MongoAuthorityStore,
    ProfileUpdate, RoleRankAssignment,
};
use crate::error::{AuthzError, Result};
use crate::permissions::{MemberDirectory, PermissionResolver, PrewarmCoordinator, PrewarmReport};

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Allowed,
    Denied(DenyReason),
}

impl Authorization {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Why a check was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// The principal's rank is below the required one.
    InsufficientRank { rank: Rank, required: Rank },
    /// The rank could not be resolved.
    Unresolved(AuthzError),
}

#[derive(Clone)]
pub struct Authority {
    store: Arc<dyn AuthorityStore>,
    guild_config: GuildConfigCache,
    entity_status: EntityStatusCache,
    resolver: PermissionResolver,
    prewarm: PrewarmCoordinator,
    store_timeout: Duration,
}

impl Authority {
    /// Build on process-local caches, whatever `config.backend` says.
    pub fn in_process(
        config: &Config,
        store: Arc<dyn AuthorityStore>,
        directory: Arc<dyn MemberDirectory>,
    ) -> Self {
        Self::with_backends(&BackendFactory::InProcess, config, store, directory)
    }

    /// Build on the backend selected by `config`, connecting to Redis when
    /// the shared backend is configured.
    pub async fn connect(
        config: &Config,
        store: Arc<dyn AuthorityStore>,
        directory: Arc<dyn MemberDirectory>,
    ) -> Result<Self> {
        let backends = match config.backend {
            BackendKind::InProcess => BackendFactory::InProcess,
            BackendKind::SharedExternal => {
                let url = config.redis_url.as_deref().ok_or_else(|| {
                    AuthzError::Config("REDIS_URL is required for the shared backend".into())
                })?;
                BackendFactory::Shared(SharedConnection::connect(url, &config.redis_prefix).await?)
            }
        };
        Ok(Self::with_backends(&backends, config, store, directory))
    }

    /// Connect to MongoDB and build on the configured cache backend.
    pub async fn connect_mongo(
        config: &Config,
        directory: Arc<dyn MemberDirectory>,
    ) -> anyhow::Result<Self> {
        let uri = config
            .mongodb_uri
            .as_deref()
            .context("MONGODB_URI must be set")?;

        info!("Connecting to MongoDB...");
        let db = Database::connect(uri, &config.mongodb_database).await?;
        info!("Database connected");

        let store: Arc<dyn AuthorityStore> = Arc::new(MongoAuthorityStore::new(&db));
        let authority = Self::connect(config, store, directory)
            .await
            .context("failed to set up the permission caches")?;
        Ok(authority)
    }

    fn with_backends(
        backends: &BackendFactory,
        config: &Config,
        store: Arc<dyn AuthorityStore>,
        directory: Arc<dyn MemberDirectory>,
    ) -> Self {
        let store_timeout = config.store_timeout();
        let guild_config = GuildConfigCache::new(
            backends,
            config.guild_config,
            store.clone(),
            store_timeout,
        );
        let entity_status = EntityStatusCache::new(
            backends,
            config.entity_status,
            store.clone(),
            store_timeout,
        );
        let resolver = PermissionResolver::new(
            backends,
            config.permissions,
            store.clone(),
            store_timeout,
        );
        let prewarm = PrewarmCoordinator::new(
            store.clone(),
            directory,
            guild_config.clone(),
            resolver.clone(),
            config.prewarm_concurrency,
        );
        info!("Permission caches initialized ({:?} backend)", config.backend);

        Self {
            store,
            guild_config,
            entity_status,
            resolver,
            prewarm,
            store_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn AuthorityStore> {
        &self.store
    }

    pub fn guild_config(&self) -> &GuildConfigCache {
        &self.guild_config
    }

    pub fn entity_status(&self) -> &EntityStatusCache {
        &self.entity_status
    }

    pub fn resolver(&self) -> &PermissionResolver {
        &self.resolver
    }

    pub fn prewarm_coordinator(&self) -> &PrewarmCoordinator {
        &self.prewarm
    }

    /// Warm every known guild. See [`PrewarmCoordinator::prewarm_all`].
    pub async fn prewarm(&self) -> PrewarmReport {
        self.prewarm.prewarm_all().await
    }

    /// Check that `user_id` holds at least `required` in `guild_id`.
    ///
    /// Fails closed: a rank that cannot be resolved is a denial.
    pub async fn authorize(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        roles: &HashSet<RoleId>,
        required: Rank,
    ) -> Authorization {
        match self.resolver.resolve(guild_id, user_id, roles).await {
            Ok(rank) if rank >= required => Authorization::Allowed,
            Ok(rank) => {
                debug!(
                    "User {} in guild {} has rank {}, needs {}",
                    user_id, guild_id, rank, required
                );
                Authorization::Denied(DenyReason::InsufficientRank { rank, required })
            }
            Err(e) => {
                warn!(
                    "Denying user {} in guild {}: rank unresolved: {}",
                    user_id, guild_id, e
                );
                Authorization::Denied(DenyReason::Unresolved(e))
            }
        }
    }

    // Mutation hooks

    /// Assign `rank` to `role_id`, replacing any previous rank of that role.
    pub async fn assign_role_rank(&self, guild_id: GuildId, role_id: RoleId, rank: Rank) -> Result<()> {
        validate_id("guild", guild_id)?;
        validate_id("role", role_id)?;
        let assignment = RoleRankAssignment::new(guild_id, role_id, rank);
        let written = with_timeout(
            "upsert_role_rank",
            self.store_timeout,
            self.store.upsert_role_rank(&assignment),
        )
        .await;
        let invalidated = self.resolver.invalidate_guild(guild_id).await.map(drop);
        settle(written, invalidated)?;
        info!("Role {} in guild {} now has rank {}", role_id, guild_id, rank);
        Ok(())
    }

    /// Remove the rank of `role_id`. Returns whether it had one.
    pub async fn unassign_role(&self, guild_id: GuildId, role_id: RoleId) -> Result<bool> {
        validate_id("guild", guild_id)?;
        validate_id("role", role_id)?;
        let removed = with_timeout(
            "delete_role_rank",
            self.store_timeout,
            self.store.delete_role_rank(guild_id, role_id),
        )
        .await;
        let invalidated = self.resolver.invalidate_guild(guild_id).await.map(drop);
        settle(removed, invalidated)
    }

    /// Replace the whole rank table of a guild.
    pub async fn replace_role_ranks(&self, guild_id: GuildId, ranks: &[(RoleId, Rank)]) -> Result<()> {
        validate_id("guild", guild_id)?;
        let assignments = ranks
            .iter()
            .map(|&(role_id, rank)| {
                validate_id("role", role_id)?;
                Ok(RoleRankAssignment::new(guild_id, role_id, rank))
            })
            .collect::<Result<Vec<_>>>()?;

        let written = with_timeout(
            "replace_role_ranks",
            self.store_timeout,
            self.store.replace_role_ranks(guild_id, &assignments),
        )
        .await;
        let invalidated = self.resolver.invalidate_guild(guild_id).await.map(drop);
        settle(written, invalidated)?;
        info!("Replaced rank table of guild {} ({} roles)", guild_id, assignments.len());
        Ok(())
    }

    /// Persist a partial profile update.
    pub async fn update_guild_profile(
        &self,
        guild_id: GuildId,
        update: &ProfileUpdate,
    ) -> Result<GuildPermissionProfile> {
        validate_id("guild", guild_id)?;
        let profile = with_timeout(
            "update_guild_profile",
            self.store_timeout,
            self.store.update_guild_profile(guild_id, update),
        )
        .await;
        let invalidated = self.guild_config.invalidate(guild_id).await;
        settle(profile, invalidated)
    }

    pub async fn set_entity_status(
        &self,
        guild_id: GuildId,
        entity_id: EntityId,
        status: EntityStatus,
    ) -> Result<()> {
        self.save_entity_status(guild_id, entity_id, Some(status)).await
    }

    pub async fn clear_entity_status(&self, guild_id: GuildId, entity_id: EntityId) -> Result<()> {
        self.save_entity_status(guild_id, entity_id, None).await
    }

    async fn save_entity_status(
        &self,
        guild_id: GuildId,
        entity_id: EntityId,
        status: Option<EntityStatus>,
    ) -> Result<()> {
        validate_id("guild", guild_id)?;
        validate_id("entity", entity_id)?;
        let written = with_timeout(
            "save_entity_status",
            self.store_timeout,
            self.store.save_entity_status(guild_id, entity_id, status),
        )
        .await;
        let invalidated = self.entity_status.invalidate(guild_id, entity_id).await;
        settle(written, invalidated)
    }

    /// The platform reported a change to a member's roles.
    pub async fn member_roles_changed(&self, guild_id: GuildId, user_id: UserId) -> Result<()> {
        self.resolver.invalidate(guild_id, user_id).await
    }

    /// Drop every cached entry in every cache.
    pub async fn reset(&self) -> Result<()> {
        self.guild_config.clear().await?;
        self.entity_status.clear().await?;
        self.resolver.clear().await?;
        info!("All permission caches cleared");
        Ok(())
    }
}

/// Combine a store write with the invalidation that follows it.
///
/// Invalidation runs whatever the write returned: a write that failed or
/// timed out may still have committed. The write error wins when both fail.
fn settle<T>(written: Result<T>, invalidated: Result<()>) -> Result<T> {
    match (written, invalidated) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
        (Err(e), Err(invalidation)) => {
            warn!("Invalidation after failed write also failed: {}", invalidation);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{MemoryAuthorityStore, ModerationState, Patch};
    use crate::permissions::StaticDirectory;

    fn authority(store: MemoryAuthorityStore) -> (Authority, Arc<MemoryAuthorityStore>) {
        let store = Arc::new(store);
        let authority = Authority::in_process(
            &Config::default(),
            store.clone(),
            Arc::new(StaticDirectory::new()),
        );
        (authority, store)
    }

    fn roles(ids: &[RoleId]) -> HashSet<RoleId> {
        ids.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_rank_change_visible_after_invalidation() {
        let (authority, store) =
            authority(MemoryAuthorityStore::new().with_ranks(42, &[(10, 3), (20, 7)]));
        let resolver = authority.resolver();

        assert_eq!(resolver.resolve(42, 99, &roles(&[10])).await.unwrap(), 3);

        store
            .upsert_role_rank(&RoleRankAssignment::new(42, 10, 1))
            .await
            .unwrap();
        // Cached until invalidated
        assert_eq!(resolver.resolve(42, 99, &roles(&[10])).await.unwrap(), 3);

        resolver.invalidate(42, 99).await.unwrap();
        assert_eq!(resolver.resolve(42, 99, &roles(&[10])).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_assign_role_rank_invalidates_before_returning() {
        let (authority, store) = authority(MemoryAuthorityStore::new().with_ranks(42, &[(10, 3)]));
        let held = roles(&[10]);

        assert_eq!(authority.resolver().resolve(42, 99, &held).await.unwrap(), 3);
        assert_eq!(authority.resolver().resolve(42, 98, &held).await.unwrap(), 3);
        assert_eq!(store.assignment_fetches(), 2);

        authority.assign_role_rank(42, 10, 1).await.unwrap();
        assert_eq!(authority.resolver().resolve(42, 99, &held).await.unwrap(), 1);
        assert_eq!(authority.resolver().resolve(42, 98, &held).await.unwrap(), 1);
        assert_eq!(store.assignment_fetches(), 4);

        assert!(authority.unassign_role(42, 10).await.unwrap());
        assert_eq!(authority.resolver().resolve(42, 99, &held).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replace_role_ranks() {
        let (authority, _) = authority(MemoryAuthorityStore::new().with_ranks(1, &[(10, 3)]));
        let held = roles(&[10, 20]);
        assert_eq!(authority.resolver().resolve(1, 5, &held).await.unwrap(), 3);

        authority.replace_role_ranks(1, &[(20, 9)]).await.unwrap();
        assert_eq!(authority.resolver().resolve(1, 5, &held).await.unwrap(), 9);
        assert_eq!(authority.resolver().resolve(1, 5, &roles(&[10])).await.unwrap(), 0);

        assert!(authority.replace_role_ranks(1, &[(-1, 2)]).await.is_err());
    }

    #[tokio::test]
    async fn test_member_roles_changed() {
        let (authority, store) = authority(MemoryAuthorityStore::new().with_ranks(1, &[(10, 3)]));
        authority.resolver().resolve(1, 5, &roles(&[10])).await.unwrap();

        authority.member_roles_changed(1, 5).await.unwrap();
        authority.resolver().resolve(1, 5, &roles(&[10])).await.unwrap();
        assert_eq!(store.assignment_fetches(), 2);
    }

    #[tokio::test]
    async fn test_update_guild_profile_partial() {
        let (authority, _) = authority(MemoryAuthorityStore::new());
        let cache = authority.guild_config();

        authority
            .update_guild_profile(7, &ProfileUpdate::new().audit_log_channel(Patch::Value(5)))
            .await
            .unwrap();
        cache.get_or_load(7).await.unwrap();
        authority
            .update_guild_profile(7, &ProfileUpdate::new().mod_log_channel(Patch::Value(9)))
            .await
            .unwrap();

        // The second write dropped the cached copy
        assert_eq!(cache.get(7).await.unwrap(), None);

        let profile = cache.get_or_load(7).await.unwrap();
        assert_eq!(profile.audit_log_channel_id, Some(5));
        assert_eq!(profile.mod_log_channel_id, Some(9));
        assert_eq!(profile.jail_role_id, None);
        assert_eq!(profile.jail_channel_id, None);

        authority
            .update_guild_profile(7, &ProfileUpdate::new().audit_log_channel(Patch::Clear))
            .await
            .unwrap();
        let profile = cache.get_or_load(7).await.unwrap();
        assert_eq!(profile.audit_log_channel_id, None);
        assert_eq!(profile.mod_log_channel_id, Some(9));
    }

    #[tokio::test]
    async fn test_entity_status_hooks() {
        let (authority, _) = authority(MemoryAuthorityStore::new());
        let cache = authority.entity_status();

        assert_eq!(cache.get_or_fetch(1, 2).await.unwrap(), EntityStatus::Flag(false));

        authority
            .set_entity_status(1, 2, ModerationState::Jailed.into())
            .await
            .unwrap();
        assert_eq!(
            cache.get_or_fetch(1, 2).await.unwrap(),
            EntityStatus::State(ModerationState::Jailed)
        );

        authority.clear_entity_status(1, 2).await.unwrap();
        assert_eq!(cache.get_or_fetch(1, 2).await.unwrap(), EntityStatus::default());
    }

    #[tokio::test]
    async fn test_authorize_fails_closed() {
        let (authority, store) = authority(MemoryAuthorityStore::new().with_ranks(1, &[(10, 5)]));
        let held = roles(&[10]);

        assert!(authority.authorize(1, 2, &held, 5).await.is_allowed());
        assert_eq!(
            authority.authorize(1, 2, &held, 6).await,
            Authorization::Denied(DenyReason::InsufficientRank {
                rank: 5,
                required: 6
            })
        );

        store.set_offline(true);
        // Cached rank still answers
        assert!(authority.authorize(1, 2, &held, 5).await.is_allowed());

        match authority.authorize(1, 3, &held, 0).await {
            Authorization::Denied(DenyReason::Unresolved(e)) => assert!(e.is_store_unavailable()),
            other => panic!("expected denial, got {other:?}"),
        }
        assert!(!authority.authorize(-1, 3, &held, 0).await.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_committed_before_timeout_still_invalidates() {
        let store = Arc::new(MemoryAuthorityStore::new().with_ranks(1, &[(10, 5)]));
        let config = Config {
            store_timeout_ms: 100,
            ..Config::default()
        };
        let authority =
            Authority::in_process(&config, store.clone(), Arc::new(StaticDirectory::new()));
        let held = roles(&[10]);
        assert_eq!(authority.resolver().resolve(1, 2, &held).await.unwrap(), 5);

        // Applied at once, acknowledged long after the timeout
        store.set_ack_delay(Some(Duration::from_secs(10)));
        let err = authority.assign_role_rank(1, 10, 0).await.unwrap_err();
        assert!(err.is_store_unavailable());
        store.set_ack_delay(None);

        assert_eq!(authority.resolver().resolve(1, 2, &held).await.unwrap(), 0);
        assert_eq!(store.assignment_fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_write_timeout_still_invalidates() {
        let store = Arc::new(MemoryAuthorityStore::new());
        let config = Config {
            store_timeout_ms: 100,
            ..Config::default()
        };
        let authority =
            Authority::in_process(&config, store.clone(), Arc::new(StaticDirectory::new()));
        authority.guild_config().get_or_load(3).await.unwrap();

        store.set_ack_delay(Some(Duration::from_secs(10)));
        let update = ProfileUpdate::new().jail_role(Patch::Value(44));
        assert!(authority.update_guild_profile(3, &update).await.is_err());
        assert_eq!(authority.guild_config().get(3).await.unwrap(), None);

        store.set_ack_delay(None);
        let profile = authority.guild_config().get_or_load(3).await.unwrap();
        assert_eq!(profile.jail_role_id, Some(44));
    }

    #[tokio::test]
    async fn test_rejected_write_still_invalidates() {
        let (authority, store) = authority(MemoryAuthorityStore::new().with_ranks(1, &[(10, 5)]));
        authority.resolver().resolve(1, 2, &roles(&[10])).await.unwrap();

        store.set_offline(true);
        let err = authority.assign_role_rank(1, 10, 1).await.unwrap_err();
        assert!(err.is_store_unavailable());

        // The cached rank is gone; with the store down the check fails closed
        assert!(authority.resolver().resolve(1, 2, &roles(&[10])).await.is_err());
        store.set_offline(false);
        assert_eq!(authority.resolver().resolve(1, 2, &roles(&[10])).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_reset_clears_every_cache() {
        let (authority, store) = authority(
            MemoryAuthorityStore::new()
                .with_ranks(1, &[(10, 5)])
                .with_profile(GuildPermissionProfile::new(1)),
        );
        authority.guild_config().get_or_load(1).await.unwrap();
        authority.entity_status().set(1, 2, true.into()).await.unwrap();
        authority.resolver().resolve(1, 2, &roles(&[10])).await.unwrap();

        authority.reset().await.unwrap();

        assert_eq!(authority.guild_config().get(1).await.unwrap(), None);
        assert_eq!(authority.entity_status().get(1, 2).await.unwrap(), None);
        authority.resolver().resolve(1, 2, &roles(&[10])).await.unwrap();
        assert_eq!(store.assignment_fetches(), 2);
    }
}
