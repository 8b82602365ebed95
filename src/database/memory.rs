//! In-process authority store.
//!
//! Holds everything in memory behind one lock. Counts reads per kind and can
//! be switched offline or slowed down, which makes it the store of choice for
//! tests and for running the bot without MongoDB.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::models::{EntityStatus, GuildPermissionProfile, ProfileUpdate, RoleRankAssignment};
use super::store::AuthorityStore;
use crate::cache::{EntityId, GuildId, Rank, RoleId};
use crate::error::{AuthzError, Result};

#[derive(Debug, Default)]
struct State {
    profiles: HashMap<GuildId, GuildPermissionProfile>,
    ranks: HashMap<GuildId, HashMap<RoleId, Rank>>,
    statuses: HashMap<(GuildId, EntityId), EntityStatus>,
}

#[derive(Debug, Default)]
pub struct MemoryAuthorityStore {
    state: RwLock<State>,
    profile_fetches: AtomicU64,
    assignment_fetches: AtomicU64,
    status_fetches: AtomicU64,
    offline: AtomicBool,
    failing_guilds: Mutex<BTreeSet<GuildId>>,
    latency: Mutex<Option<Duration>>,
    ack_delay: Mutex<Option<Duration>>,
}

impl MemoryAuthorityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed rank assignments for a guild, replacing existing ones.
    pub fn with_ranks(self, guild_id: GuildId, ranks: &[(RoleId, Rank)]) -> Self {
        self.state
            .write()
            .ranks
            .insert(guild_id, ranks.iter().copied().collect());
        self
    }

    pub fn with_profile(self, profile: GuildPermissionProfile) -> Self {
        self.state.write().profiles.insert(profile.guild_id, profile);
        self
    }

    /// Make every call fail with `StoreUnavailable` while `offline` is set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make reads for one guild fail while the others keep working.
    pub fn fail_guild(&self, guild_id: GuildId) {
        self.failing_guilds.lock().insert(guild_id);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Delay the acknowledgement of every write by `delay`, after it has
    /// been applied.
    pub fn set_ack_delay(&self, delay: Option<Duration>) {
        *self.ack_delay.lock() = delay;
    }

    pub fn profile_fetches(&self) -> u64 {
        self.profile_fetches.load(Ordering::SeqCst)
    }

    pub fn assignment_fetches(&self) -> u64 {
        self.assignment_fetches.load(Ordering::SeqCst)
    }

    pub fn status_fetches(&self) -> u64 {
        self.status_fetches.load(Ordering::SeqCst)
    }

    fn check(&self, operation: &'static str, guild_id: Option<GuildId>) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AuthzError::store(operation, "store offline"));
        }
        if let Some(guild_id) = guild_id
            && self.failing_guilds.lock().contains(&guild_id)
        {
            return Err(AuthzError::store(operation, format!("guild {guild_id} unreadable")));
        }
        Ok(())
    }

    /// Simulated round-trip. Reads snapshot before it, writes apply after it.
    async fn delay(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    async fn ack(&self) {
        let delay = *self.ack_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl AuthorityStore for MemoryAuthorityStore {
    async fn fetch_guild_profile(&self, guild_id: GuildId) -> Result<GuildPermissionProfile> {
        self.check("fetch_guild_profile", Some(guild_id))?;
        self.profile_fetches.fetch_add(1, Ordering::SeqCst);
        let profile = self
            .state
            .read()
            .profiles
            .get(&guild_id)
            .cloned()
            .unwrap_or_else(|| GuildPermissionProfile::new(guild_id));
        self.delay().await;
        Ok(profile)
    }

    async fn fetch_role_assignments(&self, guild_id: GuildId) -> Result<Vec<RoleRankAssignment>> {
        self.check("fetch_role_assignments", Some(guild_id))?;
        self.assignment_fetches.fetch_add(1, Ordering::SeqCst);
        let mut assignments: Vec<_> = self
            .state
            .read()
            .ranks
            .get(&guild_id)
            .into_iter()
            .flatten()
            .map(|(&role_id, &rank)| RoleRankAssignment::new(guild_id, role_id, rank))
            .collect();
        assignments.sort_by_key(|a| a.role_id);
        self.delay().await;
        Ok(assignments)
    }

    async fn fetch_entity_status(
        &self,
        guild_id: GuildId,
        entity_id: EntityId,
    ) -> Result<EntityStatus> {
        self.check("fetch_entity_status", Some(guild_id))?;
        self.status_fetches.fetch_add(1, Ordering::SeqCst);
        let status = self
            .state
            .read()
            .statuses
            .get(&(guild_id, entity_id))
            .copied()
            .unwrap_or_default();
        self.delay().await;
        Ok(status)
    }

    async fn known_guilds(&self) -> Result<Vec<GuildId>> {
        self.check("known_guilds", None)?;
        let guilds: BTreeSet<GuildId> = {
            let state = self.state.read();
            state
                .profiles
                .keys()
                .chain(state.ranks.keys())
                .copied()
                .collect()
        };
        self.delay().await;
        Ok(guilds.into_iter().collect())
    }

    async fn update_guild_profile(
        &self,
        guild_id: GuildId,
        update: &ProfileUpdate,
    ) -> Result<GuildPermissionProfile> {
        self.delay().await;
        self.check("update_guild_profile", Some(guild_id))?;
        let profile = {
            let mut state = self.state.write();
            let profile = state
                .profiles
                .entry(guild_id)
                .or_insert_with(|| GuildPermissionProfile::new(guild_id));
            profile.apply(update);
            profile.clone()
        };
        self.ack().await;
        Ok(profile)
    }

    async fn upsert_role_rank(&self, assignment: &RoleRankAssignment) -> Result<()> {
        self.delay().await;
        self.check("upsert_role_rank", Some(assignment.guild_id))?;
        self.state
            .write()
            .ranks
            .entry(assignment.guild_id)
            .or_default()
            .insert(assignment.role_id, assignment.rank);
        self.ack().await;
        Ok(())
    }

    async fn delete_role_rank(&self, guild_id: GuildId, role_id: RoleId) -> Result<bool> {
        self.delay().await;
        self.check("delete_role_rank", Some(guild_id))?;
        let removed = self
            .state
            .write()
            .ranks
            .get_mut(&guild_id)
            .and_then(|ranks| ranks.remove(&role_id))
            .is_some();
        self.ack().await;
        Ok(removed)
    }

    async fn replace_role_ranks(
        &self,
        guild_id: GuildId,
        assignments: &[RoleRankAssignment],
    ) -> Result<()> {
        self.delay().await;
        self.check("replace_role_ranks", Some(guild_id))?;
        let ranks = assignments.iter().map(|a| (a.role_id, a.rank)).collect();
        self.state.write().ranks.insert(guild_id, ranks);
        self.ack().await;
        Ok(())
    }

    async fn save_entity_status(
        &self,
        guild_id: GuildId,
        entity_id: EntityId,
        status: Option<EntityStatus>,
    ) -> Result<()> {
        self.delay().await;
        self.check("save_entity_status", Some(guild_id))?;
        {
            let mut state = self.state.write();
            match status {
                Some(status) => state.statuses.insert((guild_id, entity_id), status),
                None => state.statuses.remove(&(guild_id, entity_id)),
            };
        }
        self.ack().await;
        Ok(())
    }
}
