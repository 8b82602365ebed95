//! Per-guild configuration cache with partial updates.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::backend::{BackendFactory, CacheBackend};
use super::epoch::GuildEpochs;
use super::key::{GuildId, validate_id};
use super::CacheConfig;
use crate::database::store::{AuthorityStore, with_timeout};
use crate::database::{GuildPermissionProfile, ProfileUpdate};
use crate::error::Result;

/// Cache of [`GuildPermissionProfile`] keyed by guild.
#[derive(Clone)]
pub struct GuildConfigCache {
    cache: CacheBackend<GuildId, GuildPermissionProfile>,
    store: Arc<dyn AuthorityStore>,
    epochs: GuildEpochs,
    store_timeout: Duration,
}

impl GuildConfigCache {
    pub fn new(
        backends: &BackendFactory,
        config: CacheConfig,
        store: Arc<dyn AuthorityStore>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            cache: backends.build("guild_config", config),
            store,
            epochs: GuildEpochs::new(),
            store_timeout,
        }
    }

    /// Cached profile, without touching the store.
    pub async fn get(&self, guild_id: GuildId) -> Result<Option<GuildPermissionProfile>> {
        validate_id("guild", guild_id)?;
        Ok(self.cache.get(&guild_id).await)
    }

    /// Cached profile, reading it from the store on a miss.
    pub async fn get_or_load(&self, guild_id: GuildId) -> Result<GuildPermissionProfile> {
        validate_id("guild", guild_id)?;
        if let Some(profile) = self.cache.get(&guild_id).await {
            debug!("Guild config cache hit for {}", guild_id);
            return Ok(profile);
        }

        debug!("Guild config cache miss for {}", guild_id);
        let stamp = self.epochs.stamp(guild_id);
        let profile = with_timeout(
            "fetch_guild_profile",
            self.store_timeout,
            self.store.fetch_guild_profile(guild_id),
        )
        .await?;

        let cached = self
            .cache
            .fill_unless_stale(guild_id, profile.clone(), || self.epochs.is_current(&stamp))
            .await?;
        Ok(cached.unwrap_or(profile))
    }

    /// Apply a partial update to the cached profile.
    ///
    /// Fields left `Unset` keep their cached value. Without a cached profile
    /// the update starts from an empty one.
    pub async fn set(
        &self,
        guild_id: GuildId,
        update: &ProfileUpdate,
    ) -> Result<GuildPermissionProfile> {
        validate_id("guild", guild_id)?;
        // In-flight loads must not overwrite the fields set here
        self.epochs.bump(guild_id);
        let profile = self
            .cache
            .update(guild_id, |current| {
                let mut profile =
                    current.unwrap_or_else(|| GuildPermissionProfile::new(guild_id));
                profile.apply(update);
                profile
            })
            .await?;
        debug!("Updated cached guild config for {}", guild_id);
        Ok(profile)
    }

    /// Drop the cached profile so the next load reads the store.
    pub async fn invalidate(&self, guild_id: GuildId) -> Result<()> {
        validate_id("guild", guild_id)?;
        self.epochs.bump(guild_id);
        self.cache.invalidate(&guild_id).await?;
        debug!("Invalidated guild config cache for {}", guild_id);
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.epochs.bump_all();
        self.cache.clear().await
    }

    pub fn backend(&self) -> &CacheBackend<GuildId, GuildPermissionProfile> {
        &self.cache
    }
}
