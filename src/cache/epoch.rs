//! Per-guild invalidation stamps.
//!
//! A write-through that follows a store read takes a stamp before the read
//! and checks it after writing. If an invalidation for the same guild landed
//! in between, the writer drops its own entry again, so a value computed from
//! pre-mutation data never outlives the invalidation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use super::key::GuildId;

/// Snapshot of the epochs relevant to one guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochStamp {
    guild_id: GuildId,
    global: u64,
    guild: u64,
}

#[derive(Debug, Clone, Default)]
pub struct GuildEpochs {
    global: Arc<AtomicU64>,
    guilds: Arc<DashMap<GuildId, u64>>,
}

impl GuildEpochs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&self, guild_id: GuildId) -> EpochStamp {
        EpochStamp {
            guild_id,
            global: self.global.load(Ordering::Acquire),
            guild: self.guilds.get(&guild_id).map(|e| *e).unwrap_or(0),
        }
    }

    /// Whether no invalidation touched the stamped guild since `stamp`.
    pub fn is_current(&self, stamp: &EpochStamp) -> bool {
        self.stamp(stamp.guild_id) == *stamp
    }

    /// Record an invalidation affecting `guild_id`.
    pub fn bump(&self, guild_id: GuildId) {
        *self.guilds.entry(guild_id).or_insert(0) += 1;
    }

    /// Record an invalidation affecting every guild.
    pub fn bump_all(&self) {
        self.global.fetch_add(1, Ordering::AcqRel);
    }
}
