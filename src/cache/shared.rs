//! Redis-backed cache with the same contract as [`ExpiringCache`].
//!
//! Entries are stored with `SET .. PX ttl` so Redis handles expiry. Insertion
//! order is kept in a per-namespace sorted set scored by server time, and the
//! oldest members are popped when a size bound is exceeded. Keys that belong
//! to a group (a guild) are also listed in a per-group sorted set, so a whole
//! group can be dropped by any process. Insert, order bookkeeping and eviction
//! run in one Lua script.
//!
//! [`ExpiringCache`]: super::ExpiringCache

use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::CacheConfig;
use super::key::CacheKey;
use crate::error::{AuthzError, Result};

// KEYS[1] entry key, KEYS[2] order set, optional KEYS[3] group set and
// KEYS[4] group registry
// ARGV[1] payload, ARGV[2] ttl ms, ARGV[3] max size (0 = unbounded)
const SET_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local ttl = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', now - ttl)
local evicted = 0
if max > 0 and not redis.call('ZSCORE', KEYS[2], KEYS[1]) then
  local excess = redis.call('ZCARD', KEYS[2]) - max + 1
  if excess > 0 then
    local oldest = redis.call('ZPOPMIN', KEYS[2], excess)
    for i = 1, #oldest, 2 do
      redis.call('DEL', oldest[i])
      evicted = evicted + 1
    end
  end
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ttl)
redis.call('ZADD', KEYS[2], now, KEYS[1])
redis.call('PEXPIRE', KEYS[2], ttl)
if #KEYS == 4 then
  redis.call('ZREMRANGEBYSCORE', KEYS[3], '-inf', now - ttl)
  redis.call('ZADD', KEYS[3], now, KEYS[1])
  redis.call('PEXPIRE', KEYS[3], ttl)
  redis.call('ZREMRANGEBYSCORE', KEYS[4], '-inf', now - ttl)
  redis.call('ZADD', KEYS[4], now, KEYS[3])
  redis.call('PEXPIRE', KEYS[4], ttl)
end
return evicted
"#;

// KEYS[1] group set, KEYS[2] order set, KEYS[3] group registry
const INVALIDATE_GROUP_SCRIPT: &str = r#"
local members = redis.call('ZRANGE', KEYS[1], 0, -1)
local removed = 0
for _, key in ipairs(members) do
  removed = removed + redis.call('DEL', key)
  redis.call('ZREM', KEYS[2], key)
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[3], KEYS[1])
return removed
"#;

static SET: LazyLock<Script> = LazyLock::new(|| Script::new(SET_SCRIPT));
static INVALIDATE_GROUP: LazyLock<Script> =
    LazyLock::new(|| Script::new(INVALIDATE_GROUP_SCRIPT));

/// Connection shared by every namespace on the same Redis deployment.
#[derive(Clone)]
pub struct SharedConnection {
    conn: ConnectionManager,
    prefix: Arc<str>,
}

impl SharedConnection {
    /// Connect to Redis and verify the connection.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| backend_error("connect", e))?;
        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(|e| backend_error("connect", e))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_error("connect", e))?;

        info!("Connected to shared cache backend");
        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }
}

impl std::fmt::Debug for SharedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConnection")
            .field("prefix", &self.prefix)
            .finish()
    }
}

fn backend_error(cache: &str, err: RedisError) -> AuthzError {
    if err.code() == Some("OOM") {
        AuthzError::CacheExhausted {
            cache: cache.to_string(),
        }
    } else {
        AuthzError::CacheBackend {
            cache: cache.to_string(),
            reason: err.to_string(),
        }
    }
}

/// One cache namespace on a shared Redis deployment.
pub struct SharedCache<K, V> {
    conn: ConnectionManager,
    namespace: Arc<str>,
    name: Arc<str>,
    ttl: Duration,
    max_size: Option<NonZeroUsize>,
    _marker: PhantomData<fn(K) -> V>,
}

impl<K, V> Clone for SharedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            namespace: Arc::clone(&self.namespace),
            name: Arc::clone(&self.name),
            ttl: self.ttl,
            max_size: self.max_size,
            _marker: PhantomData,
        }
    }
}

impl<K, V> SharedCache<K, V>
where
    K: CacheKey,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(connection: &SharedConnection, name: &str, config: CacheConfig) -> Self {
        Self {
            conn: connection.conn.clone(),
            namespace: format!("{}:{}", connection.prefix, name).into(),
            name: name.into(),
            ttl: config.ttl,
            max_size: config.max_size,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn entry_key(&self, key: &K) -> String {
        entry_key(&self.namespace, &key.encode())
    }

    fn order_key(&self) -> String {
        order_key(&self.namespace)
    }

    fn group_key(&self, group: &str) -> String {
        group_key(&self.namespace, group)
    }

    fn registry_key(&self) -> String {
        registry_key(&self.namespace)
    }

    fn err(&self, err: RedisError) -> AuthzError {
        backend_error(&self.name, err)
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        let mut conn = self.conn.clone();
        let entry_key = self.entry_key(key);
        let payload: Option<String> = conn.get(&entry_key).await.map_err(|e| self.err(e))?;

        let Some(payload) = payload else {
            return Ok(None);
        };
        match serde_json::from_str(&payload) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                // Unreadable payloads come from an older schema; drop them
                warn!("Cache '{}' dropping undecodable entry {}: {}", self.name, entry_key, e);
                self.invalidate(key).await?;
                Ok(None)
            }
        }
    }

    pub async fn set(&self, key: K, value: &V) -> Result<()> {
        let payload = serde_json::to_string(value).map_err(|e| AuthzError::CacheBackend {
            cache: self.name.to_string(),
            reason: e.to_string(),
        })?;
        let ttl_ms = u64::try_from(self.ttl.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        let max = self.max_size.map_or(0, NonZeroUsize::get);

        let mut invocation = SET.prepare_invoke();
        invocation.key(self.entry_key(&key)).key(self.order_key());
        if let Some(group) = key.group() {
            invocation.key(self.group_key(&group)).key(self.registry_key());
        }
        invocation.arg(payload).arg(ttl_ms).arg(max);

        let mut conn = self.conn.clone();
        let evicted: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.err(e))?;

        if evicted > 0 {
            debug!("Cache '{}' evicted {} oldest entries", self.name, evicted);
        }
        Ok(())
    }

    pub async fn invalidate(&self, key: &K) -> Result<()> {
        let entry_key = self.entry_key(key);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&entry_key)
            .ignore()
            .zrem(self.order_key(), &entry_key)
            .ignore();
        if let Some(group) = key.group() {
            pipe.zrem(self.group_key(&group), &entry_key).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(|e| self.err(e))?;
        Ok(())
    }

    /// Remove every entry of `group`, whichever process wrote it.
    ///
    /// Returns the number of entries that were still present.
    pub async fn invalidate_group(&self, group: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let removed: i64 = INVALIDATE_GROUP
            .key(self.group_key(group))
            .key(self.order_key())
            .key(self.registry_key())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.err(e))?;

        debug!("Cache '{}' dropped group {} ({} entries)", self.name, group, removed);
        Ok(usize::try_from(removed).unwrap_or_default())
    }

    pub async fn clear(&self) -> Result<()> {
        let order_key = self.order_key();
        let registry_key = self.registry_key();
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn
            .zrange(&order_key, 0, -1)
            .await
            .map_err(|e| self.err(e))?;
        let groups: Vec<String> = conn
            .zrange(&registry_key, 0, -1)
            .await
            .map_err(|e| self.err(e))?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys.iter().chain(&groups) {
            pipe.del(key).ignore();
        }
        pipe.del(&order_key).ignore().del(&registry_key).ignore();
        let _: () = pipe.query_async(&mut conn).await.map_err(|e| self.err(e))?;

        debug!("Cache '{}' cleared {} entries", self.name, keys.len());
        Ok(())
    }
}

fn entry_key(namespace: &str, key: &str) -> String {
    format!("{namespace}:{key}")
}

fn order_key(namespace: &str) -> String {
    format!("{namespace}:__order")
}

fn group_key(namespace: &str, group: &str) -> String {
    format!("{namespace}:__group:{group}")
}

fn registry_key(namespace: &str) -> String {
    format!("{namespace}:__groups")
}
