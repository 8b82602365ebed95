//! Status flags attached to guild entities (members, channels).

use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::cache::{EntityId, GuildId};

/// Moderation state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationState {
    Jailed,
    Muted,
    Restricted,
}

/// A boolean flag or a named moderation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityStatus {
    Flag(bool),
    State(ModerationState),
}

impl Default for EntityStatus {
    fn default() -> Self {
        Self::Flag(false)
    }
}

impl EntityStatus {
    /// Whether the status marks the entity at all.
    pub fn is_active(&self) -> bool {
        match self {
            Self::Flag(flag) => *flag,
            Self::State(_) => true,
        }
    }
}

impl From<bool> for EntityStatus {
    fn from(flag: bool) -> Self {
        Self::Flag(flag)
    }
}

impl From<ModerationState> for EntityStatus {
    fn from(state: ModerationState) -> Self {
        Self::State(state)
    }
}

/// Stored form of an entity status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityStatusRecord {
    /// MongoDB document ID
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub guild_id: GuildId,
    pub entity_id: EntityId,
    pub status: EntityStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_serde() {
        assert_eq!(serde_json::to_string(&EntityStatus::Flag(true)).unwrap(), "true");
        assert_eq!(
            serde_json::to_string(&EntityStatus::State(ModerationState::Jailed)).unwrap(),
            "\"jailed\""
        );
        let status: EntityStatus = serde_json::from_str("\"muted\"").unwrap();
        assert_eq!(status, ModerationState::Muted.into());
    }

    #[test]
    fn test_is_active() {
        assert!(!EntityStatus::default().is_active());
        assert!(EntityStatus::from(true).is_active());
        assert!(EntityStatus::from(ModerationState::Restricted).is_active());
    }
}
