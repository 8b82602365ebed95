//! Status flags keyed by `(guild, entity)`.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::backend::BackendFactory;
use super::epoch::GuildEpochs;
use super::key::{EntityId, GuildId, MemberKey, validate_id};
use super::member::MemberCache;
use super::{CacheConfig, CacheStats};
use crate::database::EntityStatus;
use crate::database::store::{AuthorityStore, with_timeout};
use crate::error::Result;

#[derive(Clone)]
pub struct EntityStatusCache {
    cache: MemberCache<EntityStatus>,
    store: Arc<dyn AuthorityStore>,
    epochs: GuildEpochs,
    store_timeout: Duration,
}

impl EntityStatusCache {
    pub fn new(
        backends: &BackendFactory,
        config: CacheConfig,
        store: Arc<dyn AuthorityStore>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            cache: MemberCache::new(backends.build("entity_status", config)),
            store,
            epochs: GuildEpochs::new(),
            store_timeout,
        }
    }

    /// Cached status, without touching the store.
    pub async fn get(&self, guild_id: GuildId, entity_id: EntityId) -> Result<Option<EntityStatus>> {
        let key = MemberKey::new(guild_id, entity_id)?;
        Ok(self.cache.get(&key).await)
    }

    /// Cached status, reading it from the store on a miss.
    pub async fn get_or_fetch(&self, guild_id: GuildId, entity_id: EntityId) -> Result<EntityStatus> {
        let key = MemberKey::new(guild_id, entity_id)?;
        if let Some(status) = self.cache.get(&key).await {
            return Ok(status);
        }

        debug!("Entity status cache miss for {}", key);
        let stamp = self.epochs.stamp(guild_id);
        let status = with_timeout(
            "fetch_entity_status",
            self.store_timeout,
            self.store.fetch_entity_status(guild_id, entity_id),
        )
        .await?;

        let cached = self
            .cache
            .fill_unless_stale(key, status, || self.epochs.is_current(&stamp))
            .await?;
        Ok(cached.unwrap_or(status))
    }

    pub async fn set(&self, guild_id: GuildId, entity_id: EntityId, status: EntityStatus) -> Result<()> {
        let key = MemberKey::new(guild_id, entity_id)?;
        self.epochs.bump(guild_id);
        self.cache.set(key, status).await
    }

    pub async fn invalidate(&self, guild_id: GuildId, entity_id: EntityId) -> Result<()> {
        let key = MemberKey::new(guild_id, entity_id)?;
        self.epochs.bump(guild_id);
        self.cache.invalidate(&key).await?;
        debug!("Invalidated entity status for {}", key);
        Ok(())
    }

    /// Drop every cached status of `guild_id`.
    pub async fn invalidate_guild(&self, guild_id: GuildId) -> Result<usize> {
        validate_id("guild", guild_id)?;
        self.epochs.bump(guild_id);
        self.cache.invalidate_guild(guild_id).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.epochs.bump_all();
        self.cache.clear().await
    }

    pub fn stats(&self) -> Option<CacheStats> {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{MemoryAuthorityStore, ModerationState};

    fn cache_with(store: Arc<MemoryAuthorityStore>, ttl: Duration) -> EntityStatusCache {
        EntityStatusCache::new(
            &BackendFactory::InProcess,
            CacheConfig::entity_status().ttl(ttl),
            store,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_invalidate_guild_is_scoped() {
        let cache = cache_with(Arc::new(MemoryAuthorityStore::new()), Duration::from_secs(60));
        for entity in 1..=3 {
            cache.set(1, entity, true.into()).await.unwrap();
            cache.set(2, entity, ModerationState::Muted.into()).await.unwrap();
        }

        assert_eq!(cache.invalidate_guild(1).await.unwrap(), 3);
        for entity in 1..=3 {
            assert_eq!(cache.get(1, entity).await.unwrap(), None);
            assert_eq!(
                cache.get(2, entity).await.unwrap(),
                Some(EntityStatus::State(ModerationState::Muted))
            );
        }
    }

    #[tokio::test]
    async fn test_single_invalidate() {
        let cache = cache_with(Arc::new(MemoryAuthorityStore::new()), Duration::from_secs(60));
        cache.set(1, 1, true.into()).await.unwrap();
        cache.set(1, 2, true.into()).await.unwrap();

        cache.invalidate(1, 1).await.unwrap();
        assert_eq!(cache.get(1, 1).await.unwrap(), None);
        assert_eq!(cache.get(1, 2).await.unwrap(), Some(EntityStatus::Flag(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_and_expiry() {
        let store = Arc::new(MemoryAuthorityStore::new());
        store.save_entity_status(5, 6, Some(ModerationState::Jailed.into())).await.unwrap();
        let cache = cache_with(store.clone(), Duration::from_secs(60));

        let status = cache.get_or_fetch(5, 6).await.unwrap();
        assert_eq!(status, EntityStatus::State(ModerationState::Jailed));
        cache.get_or_fetch(5, 6).await.unwrap();
        assert_eq!(store.status_fetches(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get(5, 6).await.unwrap(), None);
        cache.get_or_fetch(5, 6).await.unwrap();
        assert_eq!(store.status_fetches(), 2);
    }

    #[tokio::test]
    async fn test_composite_key_validation() {
        let cache = cache_with(Arc::new(MemoryAuthorityStore::new()), Duration::from_secs(60));
        assert!(cache.set(1, -2, true.into()).await.is_err());
        assert!(cache.get(-1, 2).await.is_err());
        assert!(cache.invalidate_guild(-1).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_during_fetch_is_kept() {
        let store = Arc::new(MemoryAuthorityStore::new());
        store.set_latency(Some(Duration::from_millis(50)));
        let cache = cache_with(store, Duration::from_secs(60));

        let fetcher = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get_or_fetch(1, 2).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.set(1, 2, ModerationState::Muted.into()).await.unwrap();

        assert_eq!(
            fetcher.await.unwrap().unwrap(),
            EntityStatus::State(ModerationState::Muted)
        );
        assert_eq!(
            cache.get(1, 2).await.unwrap(),
            Some(EntityStatus::State(ModerationState::Muted))
        );
    }
}
