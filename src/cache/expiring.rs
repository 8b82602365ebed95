//! In-process expiring cache with FIFO eviction.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::CacheConfig;

/// A stored value with its deadline and insertion position. Never handed out by reference.
#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    /// Position in the insertion order.
    seq: u64,
}

impl<V> CacheEntry<V> {
    #[inline]
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Entry map plus insertion order, guarded together by one mutex.
#[derive(Debug)]
struct Entries<K, V> {
    map: HashMap<K, CacheEntry<V>>,
    order: BTreeMap<u64, K>,
    next_seq: u64,
}

impl<K, V> Entries<K, V>
where
    K: Hash + Eq + Clone,
{
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn remove(&mut self, key: &K) -> Option<CacheEntry<V>> {
        let entry = self.map.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    /// Drop the oldest-inserted entry.
    fn evict_oldest(&mut self) -> bool {
        match self.order.pop_first() {
            Some((_, key)) => {
                self.map.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Insert `value`, returning how many entries were evicted to make room.
    fn insert(
        &mut self,
        key: K,
        value: V,
        now: Instant,
        ttl: Duration,
        max_size: Option<NonZeroUsize>,
    ) -> u64 {
        let mut evicted = 0;
        if self.remove(&key).is_none()
            && let Some(max) = max_size
        {
            while self.map.len() >= max.get() && self.evict_oldest() {
                evicted += 1;
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.map.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl,
                seq,
            },
        );
        evicted
    }

    /// Live value for `key`, removing it if it has expired.
    fn live(&mut self, key: &K, now: Instant) -> Lookup<&V> {
        match self.map.get(key) {
            Some(entry) if entry.is_live(now) => {}
            Some(_) => {
                self.remove(key);
                return Lookup::Expired;
            }
            None => return Lookup::Missing,
        }
        match self.map.get(key) {
            Some(entry) => Lookup::Hit(&entry.value),
            None => Lookup::Missing,
        }
    }
}

enum Lookup<T> {
    Hit(T),
    Expired,
    Missing,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Point-in-time copy of a cache's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Hit rate in `[0.0, 1.0]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Thread-safe key/value store with a fixed per-cache TTL.
///
/// - An entry is visible iff `now < expires_at`.
/// - Expired entries are dropped when touched (passive expiry).
/// - With a size bound, the oldest-inserted entry is evicted first.
///   Reads never change eviction order.
/// - Cloning is cheap and shares the same entries.
pub struct ExpiringCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Arc<Mutex<Entries<K, V>>>,
    counters: Arc<Counters>,
    name: Arc<str>,
    ttl: Duration,
    max_size: Option<NonZeroUsize>,
}

// Shares the entries instead of copying them
impl<K, V> Clone for ExpiringCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            counters: Arc::clone(&self.counters),
            name: Arc::clone(&self.name),
            ttl: self.ttl,
            max_size: self.max_size,
        }
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a new cache with the given name and config.
    pub fn new(name: impl Into<Arc<str>>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Entries::new())),
            counters: Arc::new(Counters::default()),
            name: name.into(),
            ttl: config.ttl,
            max_size: config.max_size,
        }
    }

    /// Get the name of this cache.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_size(&self) -> Option<NonZeroUsize> {
        self.max_size
    }

    /// Store `value` under `key`, replacing any previous entry.
    ///
    /// A replaced entry moves to the back of the eviction order.
    pub fn set(&self, key: K, value: V) {
        let now = Instant::now();
        let evicted = self
            .inner
            .lock()
            .insert(key, value, now, self.ttl, self.max_size);
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
            debug!("Cache '{}' evicted {} oldest entries", self.name, evicted);
        }
    }

    /// Get a value from the cache.
    ///
    /// Returns `Some(value)` if the key exists and hasn't expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.inner.lock();
        match entries.live(key, now) {
            Lookup::Hit(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            Lookup::Expired => {
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Lookup::Missing => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Check if a live entry exists, without touching the counters.
    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .map
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Remove a key from the cache. Missing keys are ignored.
    pub fn invalidate(&self, key: &K) {
        self.inner.lock().remove(key);
    }

    /// Remove every entry whose key matches `predicate`.
    ///
    /// Returns the number of removed entries.
    pub fn invalidate_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let mut entries = self.inner.lock();
        let doomed: Vec<K> = entries.map.keys().filter(|k| predicate(k)).cloned().collect();
        for key in &doomed {
            entries.remove(key);
        }
        doomed.len()
    }

    /// Remove all entries from the cache.
    pub fn clear(&self) {
        let mut entries = self.inner.lock();
        entries.map.clear();
        entries.order.clear();
    }

    /// Atomically replace the value under `key` with `f(current)`.
    ///
    /// `current` is `None` when the key is missing or expired. Returns the
    /// stored value.
    pub fn update<F>(&self, key: K, f: F) -> V
    where
        F: FnOnce(Option<V>) -> V,
    {
        let now = Instant::now();
        let mut entries = self.inner.lock();
        let current = match entries.live(&key, now) {
            Lookup::Hit(value) => Some(value.clone()),
            Lookup::Expired | Lookup::Missing => None,
        };
        let value = f(current);
        let evicted = entries.insert(key, value.clone(), now, self.ttl, self.max_size);
        drop(entries);
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
        value
    }

    /// Store `f(current)` when it returns `Some`, leave the entry untouched
    /// when it returns `None`. Runs under the cache lock.
    ///
    /// Returns the live value afterwards.
    pub fn upsert_with<F>(&self, key: K, f: F) -> Option<V>
    where
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        let now = Instant::now();
        let mut entries = self.inner.lock();
        let current = match entries.live(&key, now) {
            Lookup::Hit(value) => Some(value.clone()),
            Lookup::Expired | Lookup::Missing => None,
        };
        let Some(value) = f(current.as_ref()) else {
            return current;
        };
        let evicted = entries.insert(key, value.clone(), now, self.ttl, self.max_size);
        drop(entries);
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
        Some(value)
    }

    /// Return the cached value, or run `fetch`, store its result and return it.
    ///
    /// Concurrent misses on the same key may each run `fetch`; the last
    /// write wins. A failed fetch caches nothing.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = fetch().await?;
        self.set(key, value.clone());
        Ok(value)
    }

    /// Drop every expired entry. Returns the number dropped.
    ///
    /// TTL is fixed per cache, so insertion order is also expiry order and
    /// the sweep stops at the first live entry.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.inner.lock();
        let mut purged = 0;
        while let Some((_, key)) = entries.order.first_key_value() {
            let expired = entries.map.get(key).is_none_or(|e| !e.is_live(now));
            if !expired {
                break;
            }
            entries.evict_oldest();
            purged += 1;
        }
        drop(entries);
        if purged > 0 {
            self.counters
                .expirations
                .fetch_add(purged as u64, Ordering::Relaxed);
            trace!("Cache '{}' purged {} expired entries", self.name, purged);
        }
        purged
    }

    /// Spawn a background task that purges expired entries every `every`.
    ///
    /// Only frees memory earlier; reads already ignore expired entries.
    pub fn spawn_janitor(&self, every: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.purge_expired();
            }
        })
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }
}

impl<K, V> std::fmt::Debug for ExpiringCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("max_size", &self.max_size)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl_ms: u64, max_size: usize) -> ExpiringCache<u32, &'static str> {
        ExpiringCache::new(
            "test",
            CacheConfig::with_ttl(Duration::from_millis(ttl_ms)).max_size(max_size),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_visibility() {
        let cache = cache(100, 0);
        cache.set(1, "one");

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(cache.get(&1), Some("one"));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(cache.get(&1), None);
        // Passive expiry removed it from storage
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_exactly_at_deadline() {
        let cache = cache(100, 0);
        cache.set(1, "one");

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(cache.contains(&1));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get(&1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_not_lru() {
        let cache = cache(10_000, 2);
        cache.set(1, "one");
        cache.set(2, "two");
        cache.set(3, "three");

        // Key 1 was the oldest and went first
        assert_eq!(cache.get(&1), None);

        // Touch key 2, then overflow again: key 2 still goes first
        assert_eq!(cache.get(&2), Some("two"));
        cache.set(4, "four");
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&3), Some("three"));
        assert_eq!(cache.get(&4), Some("four"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_access_does_not_protect_from_eviction() {
        let cache = cache(10_000, 2);
        cache.set(1, "one");
        cache.set(2, "two");
        assert_eq!(cache.get(&1), Some("one"));
        cache.set(3, "three");

        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some("two"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_does_not_evict_and_refreshes() {
        let cache = cache(100, 2);
        cache.set(1, "one");
        cache.set(2, "two");

        tokio::time::advance(Duration::from_millis(60)).await;
        cache.set(1, "uno");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);

        // Key 2 is now the oldest insert
        cache.set(3, "three");
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some("uno"));

        // Overwrite restarted the TTL for key 1
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(cache.get(&1), Some("uno"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_clear() {
        let cache = cache(10_000, 0);
        cache.set(1, "one");
        cache.set(2, "two");

        cache.invalidate(&1);
        cache.invalidate(&42);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some("two"));

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_where() {
        let cache = cache(10_000, 0);
        for key in 1..=6 {
            cache.set(key, "v");
        }
        let removed = cache.invalidate_where(|k| k % 2 == 0);
        assert_eq!(removed, 3);
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_fetch() {
        let cache = cache(10_000, 0);
        let mut calls = 0;

        let value: Result<_, ()> = cache
            .get_or_fetch(1, || {
                calls += 1;
                async { Ok("fetched") }
            })
            .await;
        assert_eq!(value, Ok("fetched"));

        let value: Result<_, ()> = cache
            .get_or_fetch(1, || {
                calls += 1;
                async { Ok("refetched") }
            })
            .await;
        assert_eq!(value, Ok("fetched"));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_fetch_failure_caches_nothing() {
        let cache = cache(10_000, 0);
        let value = cache
            .get_or_fetch(1, || async { Err::<&'static str, _>("store down") })
            .await;
        assert_eq!(value, Err("store down"));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_sees_current_value() {
        let cache = cache(100, 0);
        assert_eq!(cache.update(1, |cur| cur.unwrap_or("new")), "new");
        assert_eq!(cache.update(1, |cur| if cur == Some("new") { "seen" } else { "lost" }), "seen");

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cache.update(1, |cur| cur.unwrap_or("fresh")), "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_with_can_keep_current() {
        let cache = cache(10_000, 0);
        assert_eq!(cache.upsert_with(1, |_| None), None);
        assert!(cache.is_empty());

        assert_eq!(cache.upsert_with(1, |_| Some("one")), Some("one"));
        let kept = cache.upsert_with(1, |cur| {
            assert_eq!(cur, Some(&"one"));
            None
        });
        assert_eq!(kept, Some("one"));
        assert_eq!(cache.get(&1), Some("one"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = cache(100, 0);
        cache.set(1, "one");
        cache.set(2, "two");
        tokio::time::advance(Duration::from_millis(60)).await;
        cache.set(3, "three");
        tokio::time::advance(Duration::from_millis(60)).await;

        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_janitor_purges_in_background() {
        let cache = cache(100, 0);
        cache.set(1, "one");
        let janitor = cache.spawn_janitor(Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(160)).await;
        assert_eq!(cache.len(), 0);
        janitor.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats() {
        let cache = cache(10_000, 0);
        cache.set(1, "one");
        cache.get(&1);
        cache.get(&2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_respect_bound() {
        let cache: ExpiringCache<u32, u32> = ExpiringCache::new(
            "concurrent",
            CacheConfig::with_ttl(Duration::from_secs(60)).max_size(16),
        );
        let mut tasks = Vec::new();
        for worker in 0..8u32 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..200u32 {
                    cache.set(worker * 1_000 + i, i);
                    cache.get(&(worker * 1_000 + i / 2));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(cache.len(), 16);
    }
}
