//! Cache module - expiring caches and the managers built on them.
//!
//! ## Architecture
//!
//! - `ExpiringCache` - in-process map with a fixed TTL and FIFO eviction
//! - `SharedCache` - the same contract on a shared Redis deployment
//! - `CacheBackend` - one of the two, picked once by `BackendFactory`
//! - `GuildConfigCache` / `EntityStatusCache` - domain caches on top
//!
//! ## Usage
//!
//! ```rust,ignore
//! let backends = BackendFactory::InProcess;
//! let ranks: CacheBackend<MemberKey, ResolvedRank> =
//!     backends.build("ranks", CacheConfig::permissions());
//!
//! ranks.set(key, rank).await?;
//! let rank = ranks.get(&key).await;
//! ```

mod backend;
mod config;
mod entity_status;
mod epoch;
mod expiring;
mod guild_config;
mod key;
mod member;
mod shared;

pub use backend::{BackendFactory, CacheBackend};
pub use config::CacheConfig;
pub use entity_status::EntityStatusCache;
pub use epoch::{EpochStamp, GuildEpochs};
pub use expiring::{CacheStats, ExpiringCache};
pub use guild_config::GuildConfigCache;
pub use key::{
    CacheKey, ChannelId, EntityId, GuildId, MemberKey, Rank, RoleId, UserId, validate_id,
};
pub use member::MemberCache;
pub use shared::{SharedCache, SharedConnection};
