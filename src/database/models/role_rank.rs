//! Role to rank assignments.

use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::cache::{GuildId, Rank, RoleId};

/// Maps one role of a guild to a rank. At most one rank per role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRankAssignment {
    /// MongoDB document ID
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub guild_id: GuildId,
    pub role_id: RoleId,
    pub rank: Rank,
}

impl RoleRankAssignment {
    pub fn new(guild_id: GuildId, role_id: RoleId, rank: Rank) -> Self {
        Self {
            id: None,
            guild_id,
            role_id,
            rank,
        }
    }
}
