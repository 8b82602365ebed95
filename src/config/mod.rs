//! Configuration for the permission caches.
//!
//! Loads configuration from environment variables, or from a JSON document
//! carrying the same options.

use std::env;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::error::{AuthzError, Result};

/// Where cache entries live.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Process-local maps.
    #[default]
    InProcess,
    /// A Redis deployment shared between processes.
    SharedExternal,
}

impl FromStr for BackendKind {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "in_process" => Ok(Self::InProcess),
            "shared_external" => Ok(Self::SharedExternal),
            other => Err(AuthzError::Config(format!("unknown cache backend '{other}'"))),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub backend: BackendKind,

    /// Required when `backend` is `shared_external`.
    pub redis_url: Option<String>,

    /// Namespace prefix for shared cache keys.
    pub redis_prefix: String,

    // MongoDB
    pub mongodb_uri: Option<String>,
    pub mongodb_database: String,

    pub guild_config: CacheConfig,
    pub entity_status: CacheConfig,
    pub permissions: CacheConfig,

    /// Upper bound for a single authority store call on a cache miss.
    pub store_timeout_ms: u64,

    /// Guilds warmed in parallel at startup.
    pub prewarm_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::InProcess,
            redis_url: None,
            redis_prefix: "elysium".to_string(),
            mongodb_uri: None,
            mongodb_database: "elysium".to_string(),
            guild_config: CacheConfig::guild_config(),
            entity_status: CacheConfig::entity_status(),
            permissions: CacheConfig::permissions(),
            store_timeout_ms: 3_000,
            prewarm_concurrency: 8,
        }
    }
}

impl Config {
    /// Load configuration from environment variables (and `.env`).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let backend = match var("CACHE_BACKEND") {
            Some(value) => value.parse()?,
            None => defaults.backend,
        };

        let config = Self {
            backend,
            redis_url: var("REDIS_URL"),
            redis_prefix: var("REDIS_PREFIX").unwrap_or(defaults.redis_prefix),
            mongodb_uri: var("MONGODB_URI"),
            mongodb_database: var("MONGODB_DATABASE").unwrap_or(defaults.mongodb_database),
            guild_config: cache_from_vars(&var, "GUILD_CONFIG", defaults.guild_config)?,
            entity_status: cache_from_vars(&var, "ENTITY_STATUS", defaults.entity_status)?,
            permissions: cache_from_vars(&var, "PERMISSION", defaults.permissions)?,
            store_timeout_ms: parse_var(&var, "STORE_TIMEOUT_MS")?
                .unwrap_or(defaults.store_timeout_ms),
            prewarm_concurrency: parse_var(&var, "PREWARM_CONCURRENCY")?
                .unwrap_or(defaults.prewarm_concurrency),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse the JSON form of the options.
    ///
    /// ```json
    /// { "backend": "in_process", "permissions": { "ttl_seconds": 300, "max_size": 10000 } }
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| AuthzError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.backend == BackendKind::SharedExternal && self.redis_url.is_none() {
            return Err(AuthzError::Config(
                "REDIS_URL must be set when the cache backend is shared_external".into(),
            ));
        }
        if self.store_timeout_ms == 0 {
            return Err(AuthzError::Config("store timeout must be positive".into()));
        }
        if self.prewarm_concurrency == 0 {
            return Err(AuthzError::Config("prewarm concurrency must be positive".into()));
        }
        Ok(())
    }
}

fn parse_var<T, F>(var: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|raw| {
            raw.parse()
                .map_err(|_| AuthzError::Config(format!("{name} has invalid value '{raw}'")))
        })
        .transpose()
}

/// Read `<PREFIX>_TTL_SECS` and `<PREFIX>_MAX_SIZE` over `defaults`.
fn cache_from_vars<F>(var: &F, prefix: &str, defaults: CacheConfig) -> Result<CacheConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let ttl_name = format!("{prefix}_TTL_SECS");
    let size_name = format!("{prefix}_MAX_SIZE");

    let mut config = defaults;
    if let Some(secs) = parse_var::<u64, _>(var, &ttl_name)? {
        if secs == 0 {
            return Err(AuthzError::Config(format!("{ttl_name} must be positive")));
        }
        config.ttl = Duration::from_secs(secs);
    }
    if let Some(size) = parse_var::<usize, _>(var, &size_name)? {
        config.max_size = Some(
            NonZeroUsize::new(size)
                .ok_or_else(|| AuthzError::Config(format!("{size_name} must be positive")))?,
        );
    }
    Ok(config)
}
