//! Permission system: rank resolution and cache pre-warming.
//!
//! A principal's rank is the highest rank assigned to any of their roles in
//! the guild, or 0 when none of their roles is assigned.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let rank = resolver.resolve(guild_id, user_id, &roles).await?;
//! if rank >= required {
//!     // ...
//! }
//!
//! // Many principals, one store read
//! let ranks = resolver.resolve_batch(guild_id, &principals).await?;
//! ```

mod prewarm;
mod resolver;

pub use prewarm::{GuildWarmup, MemberDirectory, PrewarmCoordinator, PrewarmReport, StaticDirectory};
pub use resolver::{Principal, PermissionResolver, ResolvedRank, effective_rank, rank_table};
