//! Cache configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

use crate::error::AuthzError;

/// Configuration for a cache instance.
///
/// The TTL is fixed per cache, never per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawCacheConfig")]
pub struct CacheConfig {
    /// Time-to-live for every entry of the cache.
    pub ttl: Duration,

    /// Maximum number of entries. When an insert would exceed it the
    /// oldest-inserted entry is evicted.
    pub max_size: Option<NonZeroUsize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300), // 5 minutes
            max_size: None,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with the given TTL and no size bound.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl, max_size: None }
    }

    /// Set time-to-live for cache entries.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Bound the cache to `max_size` entries. Zero removes the bound.
    #[must_use]
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = NonZeroUsize::new(max_size);
        self
    }

    /// Remove the size bound.
    #[must_use]
    pub fn unbounded(mut self) -> Self {
        self.max_size = None;
        self
    }

    /// Per-guild configuration fields.
    /// Guild count is bounded by deployment scale, so no size bound.
    pub fn guild_config() -> Self {
        Self {
            ttl: Duration::from_secs(300), // 5 minutes
            max_size: None,
        }
    }

    /// Status flags keyed by (guild, entity). These change often.
    pub fn entity_status() -> Self {
        Self {
            ttl: Duration::from_secs(60), // 1 minute
            max_size: None,
        }
    }

    /// Resolved ranks keyed by (guild, user).
    pub fn permissions() -> Self {
        Self {
            ttl: Duration::from_secs(300), // 5 minutes
            max_size: NonZeroUsize::new(10_000),
        }
    }
}

/// Wire form of the recognised options: `{ ttl_seconds, max_size }`.
#[derive(Debug, Deserialize)]
struct RawCacheConfig {
    ttl_seconds: u64,
    #[serde(default)]
    max_size: Option<usize>,
}

impl TryFrom<RawCacheConfig> for CacheConfig {
    type Error = AuthzError;

    fn try_from(raw: RawCacheConfig) -> Result<Self, Self::Error> {
        if raw.ttl_seconds == 0 {
            return Err(AuthzError::Config("ttl_seconds must be positive".into()));
        }
        let max_size = match raw.max_size {
            Some(0) => {
                return Err(AuthzError::Config(
                    "max_size must be positive when set".into(),
                ));
            }
            Some(n) => NonZeroUsize::new(n),
            None => None,
        };
        Ok(Self {
            ttl: Duration::from_secs(raw.ttl_seconds),
            max_size,
        })
    }
}
