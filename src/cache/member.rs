//! Caches keyed by `(guild, member)` with whole-guild invalidation.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::backend::CacheBackend;
use super::key::{GuildId, MemberKey, guild_group};
use super::{CacheStats, ExpiringCache};
use crate::error::Result;

/// A [`CacheBackend`] over [`MemberKey`] that can drop every entry of a guild.
///
/// In-process caches scan their own keys. The shared backend keeps a
/// per-guild key set next to the entries, so a guild is dropped everywhere
/// no matter which process wrote its entries.
pub struct MemberCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    cache: CacheBackend<MemberKey, V>,
}

impl<V> Clone for MemberCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<V> MemberCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(cache: CacheBackend<MemberKey, V>) -> Self {
        Self { cache }
    }

    pub async fn get(&self, key: &MemberKey) -> Option<V> {
        self.cache.get(key).await
    }

    pub async fn set(&self, key: MemberKey, value: V) -> Result<()> {
        self.cache.set(key, value).await
    }

    /// Write-through after a store read; failures are logged only.
    pub async fn fill(&self, key: MemberKey, value: V) {
        self.cache.fill(key, value).await;
    }

    /// See [`CacheBackend::fill_unless_stale`].
    pub async fn fill_unless_stale<F>(&self, key: MemberKey, value: V, is_fresh: F) -> Result<Option<V>>
    where
        F: Fn() -> bool,
    {
        self.cache.fill_unless_stale(key, value, is_fresh).await
    }

    pub async fn invalidate(&self, key: &MemberKey) -> Result<()> {
        self.cache.invalidate(key).await
    }

    /// Remove every entry of `guild_id`, leaving other guilds untouched.
    ///
    /// Returns the number of entries removed.
    pub async fn invalidate_guild(&self, guild_id: GuildId) -> Result<usize> {
        let removed = match &self.cache {
            CacheBackend::InProcess(cache) => {
                cache.invalidate_where(|key| key.guild_id == guild_id)
            }
            CacheBackend::Shared(cache) => cache.invalidate_group(&guild_group(guild_id)).await?,
        };
        debug!(
            "Cache '{}' dropped {} entries for guild {}",
            self.cache.name(),
            removed,
            guild_id
        );
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<()> {
        self.cache.clear().await
    }

    pub fn local(&self) -> Option<&ExpiringCache<MemberKey, V>> {
        self.cache.local()
    }

    pub fn stats(&self) -> Option<CacheStats> {
        self.cache.stats()
    }
}
