//! Backend selection: in-process map or shared Redis.
//!
//! The variant is picked once when a cache manager is built. Callers see the
//! same get/set/invalidate contract either way; the shared variant only adds
//! network failure modes.

use std::future::Future;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::key::CacheKey;
use super::shared::{SharedCache, SharedConnection};
use super::{CacheConfig, CacheStats, ExpiringCache};
use crate::error::Result;

/// A cache namespace living either in this process or on a shared store.
pub enum CacheBackend<K, V>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
{
    InProcess(ExpiringCache<K, V>),
    Shared(SharedCache<K, V>),
}

impl<K, V> Clone for CacheBackend<K, V>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        match self {
            Self::InProcess(cache) => Self::InProcess(cache.clone()),
            Self::Shared(cache) => Self::Shared(cache.clone()),
        }
    }
}

impl<K, V> CacheBackend<K, V>
where
    K: CacheKey,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn name(&self) -> &str {
        match self {
            Self::InProcess(cache) => cache.name(),
            Self::Shared(cache) => cache.name(),
        }
    }

    /// Cached value for `key`.
    ///
    /// A shared-backend read failure is logged and reported as a miss, so the
    /// caller falls through to the authority store.
    pub async fn get(&self, key: &K) -> Option<V> {
        match self {
            Self::InProcess(cache) => cache.get(key),
            Self::Shared(cache) => match cache.get(key).await {
                Ok(value) => value,
                Err(e) => {
                    warn!("Shared cache '{}' read failed, treating as miss: {}", cache.name(), e);
                    None
                }
            },
        }
    }

    pub async fn set(&self, key: K, value: V) -> Result<()> {
        match self {
            Self::InProcess(cache) => {
                cache.set(key, value);
                Ok(())
            }
            Self::Shared(cache) => cache.set(key, &value).await,
        }
    }

    /// Write-through after a store read. Failures only cost a future miss.
    pub async fn fill(&self, key: K, value: V) {
        if let Err(e) = self.set(key, value).await {
            warn!("Cache '{}' write-through failed: {}", self.name(), e);
        }
    }

    /// Write-through of a value read from the store while `is_fresh` still
    /// holds. Once it no longer holds (an invalidation or a direct `set` came
    /// in during the read) the current entry is left as it is.
    ///
    /// Returns the entry that is cached afterwards, if any.
    pub async fn fill_unless_stale<F>(&self, key: K, value: V, is_fresh: F) -> Result<Option<V>>
    where
        F: Fn() -> bool,
    {
        match self {
            Self::InProcess(cache) => Ok(cache.upsert_with(key, |_| is_fresh().then_some(value))),
            Self::Shared(cache) => {
                if !is_fresh() {
                    return Ok(self.get(&key).await);
                }
                self.fill(key.clone(), value.clone()).await;
                if is_fresh() {
                    return Ok(Some(value));
                }
                // Lost the race after writing; a concurrent `set` is dropped
                // with it and the next read goes back to the store
                cache.invalidate(&key).await?;
                Ok(None)
            }
        }
    }

    pub async fn invalidate(&self, key: &K) -> Result<()> {
        match self {
            Self::InProcess(cache) => {
                cache.invalidate(key);
                Ok(())
            }
            Self::Shared(cache) => cache.invalidate(key).await,
        }
    }

    pub async fn clear(&self) -> Result<()> {
        match self {
            Self::InProcess(cache) => {
                cache.clear();
                Ok(())
            }
            Self::Shared(cache) => cache.clear().await,
        }
    }

    /// Replace the value under `key` with `f(current)` and return it.
    ///
    /// Atomic in-process. On the shared backend this is a read followed by a
    /// write, so a concurrent writer in another process can be lost.
    pub async fn update<F>(&self, key: K, f: F) -> Result<V>
    where
        F: FnOnce(Option<V>) -> V,
    {
        match self {
            Self::InProcess(cache) => Ok(cache.update(key, f)),
            Self::Shared(cache) => {
                let current = cache.get(&key).await?;
                let value = f(current);
                cache.set(key, &value).await?;
                Ok(value)
            }
        }
    }

    /// See [`ExpiringCache::get_or_fetch`]. Fetch errors propagate and
    /// nothing is cached.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: K, fetch: F) -> std::result::Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        match self {
            Self::InProcess(cache) => cache.get_or_fetch(key, fetch).await,
            Self::Shared(_) => {
                if let Some(value) = self.get(&key).await {
                    return Ok(value);
                }
                let value = fetch().await?;
                self.fill(key, value.clone()).await;
                Ok(value)
            }
        }
    }

    /// The in-process cache, if this backend is one.
    pub fn local(&self) -> Option<&ExpiringCache<K, V>> {
        match self {
            Self::InProcess(cache) => Some(cache),
            Self::Shared(_) => None,
        }
    }

    /// Counters for in-process caches. The shared backend keeps none.
    pub fn stats(&self) -> Option<CacheStats> {
        self.local().map(ExpiringCache::stats)
    }
}

/// Builds cache namespaces for the configured backend.
#[derive(Debug, Clone)]
pub enum BackendFactory {
    InProcess,
    Shared(SharedConnection),
}

impl BackendFactory {
    pub fn build<K, V>(&self, name: &str, config: CacheConfig) -> CacheBackend<K, V>
    where
        K: CacheKey,
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        match self {
            Self::InProcess => CacheBackend::InProcess(ExpiringCache::new(name, config)),
            Self::Shared(conn) => CacheBackend::Shared(SharedCache::new(conn, name, config)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn backend() -> CacheBackend<i64, String> {
        BackendFactory::InProcess.build("test", CacheConfig::with_ttl(Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn test_in_process_contract() {
        let cache = backend();
        assert_eq!(cache.name(), "test");
        assert_eq!(cache.get(&1).await, None);

        cache.set(1, "one".into()).await.unwrap();
        assert_eq!(cache.get(&1).await.as_deref(), Some("one"));

        cache.invalidate(&1).await.unwrap();
        assert_eq!(cache.get(&1).await, None);

        cache.set(2, "two".into()).await.unwrap();
        cache.clear().await.unwrap();
        assert_eq!(cache.get(&2).await, None);
    }

    #[tokio::test]
    async fn test_update_and_fetch() {
        let cache = backend();
        let value = cache
            .update(1, |cur| cur.unwrap_or_default() + "a")
            .await
            .unwrap();
        assert_eq!(value, "a");
        let value = cache
            .update(1, |cur| cur.unwrap_or_default() + "b")
            .await
            .unwrap();
        assert_eq!(value, "ab");

        let fetched: std::result::Result<String, ()> = cache
            .get_or_fetch(2, || async { Ok("fetched".to_string()) })
            .await;
        assert_eq!(fetched.as_deref(), Ok("fetched"));
        assert_eq!(cache.stats().map(|s| s.hits), Some(0));
        assert!(cache.local().is_some_and(|c| c.contains(&2)));
    }

    #[tokio::test]
    async fn test_fill_unless_stale() {
        let cache = backend();
        let filled = cache.fill_unless_stale(1, "loaded".into(), || true).await.unwrap();
        assert_eq!(filled.as_deref(), Some("loaded"));

        cache.set(1, "newer".into()).await.unwrap();
        let kept = cache.fill_unless_stale(1, "older".into(), || false).await.unwrap();
        assert_eq!(kept.as_deref(), Some("newer"));

        let none = cache.fill_unless_stale(2, "older".into(), || false).await.unwrap();
        assert_eq!(none, None);
        assert_eq!(cache.get(&2).await, None);
    }
}
