//! Rank resolution with caching.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{
    BackendFactory, CacheConfig, CacheStats, EpochStamp, GuildEpochs, GuildId, MemberCache,
    MemberKey, Rank, RoleId, UserId, validate_id,
};
use crate::database::RoleRankAssignment;
use crate::database::store::{AuthorityStore, with_timeout};
use crate::error::Result;

/// Cached result of a resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRank {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub rank: Rank,
    /// Sorted role set the rank was computed from.
    pub roles: Vec<RoleId>,
    pub computed_at: DateTime<Utc>,
}

/// A user together with the roles they currently hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub roles: HashSet<RoleId>,
}

impl Principal {
    pub fn new(user_id: UserId, roles: impl IntoIterator<Item = RoleId>) -> Self {
        Self {
            user_id,
            roles: roles.into_iter().collect(),
        }
    }
}

/// Build the role -> rank lookup for one guild.
///
/// A role listed twice keeps its highest rank.
pub fn rank_table(assignments: &[RoleRankAssignment]) -> HashMap<RoleId, Rank> {
    let mut table = HashMap::with_capacity(assignments.len());
    for assignment in assignments {
        table
            .entry(assignment.role_id)
            .and_modify(|rank: &mut Rank| {
                warn!(
                    "Role {} in guild {} has more than one rank assignment",
                    assignment.role_id, assignment.guild_id
                );
                *rank = (*rank).max(assignment.rank);
            })
            .or_insert(assignment.rank);
    }
    table
}

/// Highest rank among `roles`. Unassigned roles contribute nothing; no
/// assigned role at all means rank 0.
pub fn effective_rank(table: &HashMap<RoleId, Rank>, roles: &HashSet<RoleId>) -> Rank {
    roles
        .iter()
        .filter_map(|role| table.get(role))
        .copied()
        .max()
        .unwrap_or(0)
}

fn fingerprint(roles: &HashSet<RoleId>) -> Vec<RoleId> {
    let mut sorted: Vec<RoleId> = roles.iter().copied().collect();
    sorted.sort_unstable();
    sorted
}

/// Resolves a principal's rank from their roles and the guild's rank table.
///
/// Results are cached per `(guild, user)`. A cached rank is only reused for
/// the same role set it was computed from.
#[derive(Clone)]
pub struct PermissionResolver {
    cache: MemberCache<ResolvedRank>,
    store: Arc<dyn AuthorityStore>,
    epochs: GuildEpochs,
    store_timeout: Duration,
}

impl PermissionResolver {
    pub fn new(
        backends: &BackendFactory,
        config: CacheConfig,
        store: Arc<dyn AuthorityStore>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            cache: MemberCache::new(backends.build("resolved_ranks", config)),
            store,
            epochs: GuildEpochs::new(),
            store_timeout,
        }
    }

    /// Effective rank of `user_id` in `guild_id`.
    ///
    /// # Errors
    /// `InvalidKey` for negative ids, `StoreUnavailable` when the rank table
    /// cannot be read on a miss. Callers must deny on error.
    pub async fn resolve(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        roles: &HashSet<RoleId>,
    ) -> Result<Rank> {
        self.resolve_within(guild_id, user_id, roles, self.store_timeout)
            .await
    }

    /// Like [`resolve`](Self::resolve) with a caller-supplied store timeout.
    pub async fn resolve_within(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        roles: &HashSet<RoleId>,
        timeout: Duration,
    ) -> Result<Rank> {
        let key = MemberKey::new(guild_id, user_id)?;
        let roles_fp = fingerprint(roles);

        if let Some(cached) = self.cached(&key, &roles_fp).await {
            debug!("Rank cache hit for user {} in guild {}", user_id, guild_id);
            return Ok(cached.rank);
        }

        debug!("Rank cache miss for user {} in guild {}", user_id, guild_id);
        let stamp = self.epochs.stamp(guild_id);
        let table = self.fetch_table(guild_id, timeout).await?;
        let rank = effective_rank(&table, roles);

        self.cache
            .fill(key, resolved(key, rank, roles_fp))
            .await;
        self.discard_if_stale(&stamp, &[key]).await?;
        Ok(rank)
    }

    /// Resolve many principals of one guild with at most one store read.
    ///
    /// A user listed twice keeps the rank of their last entry.
    pub async fn resolve_batch(
        &self,
        guild_id: GuildId,
        principals: &[Principal],
    ) -> Result<HashMap<UserId, Rank>> {
        validate_id("guild", guild_id)?;
        let mut ranks = HashMap::with_capacity(principals.len());
        let mut misses = Vec::new();

        for principal in principals {
            let key = MemberKey::new(guild_id, principal.user_id)?;
            let roles_fp = fingerprint(&principal.roles);
            match self.cached(&key, &roles_fp).await {
                Some(cached) => {
                    ranks.insert(principal.user_id, cached.rank);
                }
                None => misses.push((key, principal, roles_fp)),
            }
        }

        let hits = ranks.len();
        if misses.is_empty() {
            debug!("Resolved {} principals in guild {} from cache", hits, guild_id);
            return Ok(ranks);
        }

        let stamp = self.epochs.stamp(guild_id);
        let table = self.fetch_table(guild_id, self.store_timeout).await?;

        let mut written = Vec::with_capacity(misses.len());
        for (key, principal, roles_fp) in misses {
            let rank = effective_rank(&table, &principal.roles);
            ranks.insert(principal.user_id, rank);
            self.cache.fill(key, resolved(key, rank, roles_fp)).await;
            written.push(key);
        }
        self.discard_if_stale(&stamp, &written).await?;

        debug!(
            "Resolved {} principals in guild {} ({} cached, {} computed)",
            principals.len(),
            guild_id,
            hits,
            written.len()
        );
        Ok(ranks)
    }

    /// Forget the cached rank of one user. Call before acknowledging any
    /// change to that user's roles.
    pub async fn invalidate(&self, guild_id: GuildId, user_id: UserId) -> Result<()> {
        let key = MemberKey::new(guild_id, user_id)?;
        self.epochs.bump(guild_id);
        self.cache.invalidate(&key).await?;
        debug!("Invalidated rank cache for user {} in guild {}", user_id, guild_id);
        Ok(())
    }

    /// Forget every cached rank of a guild. Call before acknowledging any
    /// change to the guild's rank table.
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

    async fn cached(&self, key: &MemberKey, roles_fp: &[RoleId]) -> Option<ResolvedRank> {
        let cached = self.cache.get(key).await?;
        if cached.roles == roles_fp {
            Some(cached)
        } else {
            debug!("Role set changed for {}, recomputing rank", key);
            None
        }
    }

    async fn fetch_table(
        &self,
        guild_id: GuildId,
        timeout: Duration,
    ) -> Result<HashMap<RoleId, Rank>> {
        let assignments = with_timeout(
            "fetch_role_assignments",
            timeout,
            self.store.fetch_role_assignments(guild_id),
        )
        .await?;
        Ok(rank_table(&assignments))
    }

    /// Drop entries written from data read before an invalidation.
    async fn discard_if_stale(&self, stamp: &EpochStamp, keys: &[MemberKey]) -> Result<()> {
        if self.epochs.is_current(stamp) {
            return Ok(());
        }
        debug!("Rank table changed during resolution, discarding {} entries", keys.len());
        for key in keys {
            self.cache.invalidate(key).await?;
        }
        Ok(())
    }
}

fn resolved(key: MemberKey, rank: Rank, roles: Vec<RoleId>) -> ResolvedRank {
    ResolvedRank {
        guild_id: key.guild_id,
        user_id: key.member_id,
        rank,
        roles,
        computed_at: Utc::now(),
    }
}
