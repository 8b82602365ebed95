//! Startup cache pre-warming.
//!
//! Best effort: a guild that fails to warm is logged and skipped, and a cold
//! cache still answers correctly, only slower.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::resolver::{PermissionResolver, Principal};
use crate::cache::{GuildConfigCache, GuildId, validate_id};
use crate::database::AuthorityStore;
use crate::error::Result;

/// Source of the currently active principals of a guild.
///
/// Role membership lives on the chat platform, not in the authority store.
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn active_members(&self, guild_id: GuildId) -> Result<Vec<Principal>>;
}

/// Directory backed by a snapshot the caller keeps up to date.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    members: RwLock<HashMap<GuildId, Vec<Principal>>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot for one guild.
    pub fn set_members(&self, guild_id: GuildId, members: Vec<Principal>) {
        self.members.write().insert(guild_id, members);
    }
}

#[async_trait]
impl MemberDirectory for StaticDirectory {
    async fn active_members(&self, guild_id: GuildId) -> Result<Vec<Principal>> {
        Ok(self
            .members
            .read()
            .get(&guild_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Outcome of warming one guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuildWarmup {
    pub guild_id: GuildId,
    pub principals: usize,
}

/// Outcome of warming every known guild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrewarmReport {
    pub warmed: Vec<GuildWarmup>,
    pub failed: Vec<GuildId>,
}

impl PrewarmReport {
    pub fn principals(&self) -> usize {
        self.warmed.iter().map(|w| w.principals).sum()
    }
}

/// Fills the guild config and rank caches before real traffic arrives.
#[derive(Clone)]
pub struct PrewarmCoordinator {
    store: Arc<dyn AuthorityStore>,
    directory: Arc<dyn MemberDirectory>,
    guild_config: GuildConfigCache,
    resolver: PermissionResolver,
    concurrency: usize,
}

impl PrewarmCoordinator {
    pub fn new(
        store: Arc<dyn AuthorityStore>,
        directory: Arc<dyn MemberDirectory>,
        guild_config: GuildConfigCache,
        resolver: PermissionResolver,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            directory,
            guild_config,
            resolver,
            concurrency: concurrency.max(1),
        }
    }

    /// Warm one guild: its profile and the ranks of its active members.
    pub async fn prewarm_guild(&self, guild_id: GuildId) -> Result<GuildWarmup> {
        validate_id("guild", guild_id)?;
        self.guild_config.get_or_load(guild_id).await?;

        let members = self.directory.active_members(guild_id).await?;
        if !members.is_empty() {
            self.resolver.resolve_batch(guild_id, &members).await?;
        }

        Ok(GuildWarmup {
            guild_id,
            principals: members.len(),
        })
    }

    /// Warm every guild the store knows about. Never fails: errors are
    /// logged and counted in the report.
    pub async fn prewarm_all(&self) -> PrewarmReport {
        let guilds = match self.store.known_guilds().await {
            Ok(guilds) => guilds,
            Err(e) => {
                warn!("Pre-warm skipped, could not list guilds: {}", e);
                return PrewarmReport::default();
            }
        };
        info!("Pre-warming caches for {} guilds", guilds.len());

        let outcomes: Vec<(GuildId, Result<GuildWarmup>)> = futures::stream::iter(guilds)
            .map(|guild_id| async move { (guild_id, self.prewarm_guild(guild_id).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = PrewarmReport::default();
        for (guild_id, outcome) in outcomes {
            match outcome {
                Ok(warmup) => report.warmed.push(warmup),
                Err(e) => {
                    warn!("Pre-warm failed for guild {}: {}", guild_id, e);
                    report.failed.push(guild_id);
                }
            }
        }
        report.warmed.sort_by_key(|w| w.guild_id);
        report.failed.sort_unstable();

        info!(
            "Pre-warm finished: {} guilds warmed ({} principals), {} failed",
            report.warmed.len(),
            report.principals(),
            report.failed.len()
        );
        report
    }
}
