//! Cache keys and id validation.

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::error::{AuthzError, Result};

pub type GuildId = i64;
pub type UserId = i64;
pub type RoleId = i64;
pub type ChannelId = i64;
pub type EntityId = i64;

/// Integer privilege level; higher is more privileged.
pub type Rank = i64;

/// Reject ids the platform never hands out.
pub fn validate_id(kind: &'static str, id: i64) -> Result<i64> {
    if id < 0 {
        return Err(AuthzError::InvalidKey { kind, id });
    }
    Ok(id)
}

/// A key that can live in any cache backend.
///
/// The encoded form is used by the shared backend and must be stable
/// across processes.
pub trait CacheKey: Hash + Eq + Clone + Send + Sync + 'static {
    fn encode(&self) -> String;

    /// Group the key can be invalidated with, if any.
    fn group(&self) -> Option<String> {
        None
    }
}

impl CacheKey for i64 {
    fn encode(&self) -> String {
        self.to_string()
    }
}

/// Composite `(guild, member)` key, where member is a user or any other entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberKey {
    pub guild_id: GuildId,
    pub member_id: i64,
}

impl MemberKey {
    /// Build a validated key.
    pub fn new(guild_id: GuildId, member_id: i64) -> Result<Self> {
        Ok(Self {
            guild_id: validate_id("guild", guild_id)?,
            member_id: validate_id("member", member_id)?,
        })
    }
}

impl CacheKey for MemberKey {
    fn encode(&self) -> String {
        format!("{}:{}", self.guild_id, self.member_id)
    }

    /// Member keys are grouped by guild.
    fn group(&self) -> Option<String> {
        Some(guild_group(self.guild_id))
    }
}

/// Group name shared by every member key of `guild_id`.
pub(crate) fn guild_group(guild_id: GuildId) -> String {
    guild_id.to_string()
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.guild_id, self.member_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_ids_rejected() {
        assert_eq!(
            MemberKey::new(-1, 5),
            Err(AuthzError::InvalidKey { kind: "guild", id: -1 })
        );
        assert_eq!(
            MemberKey::new(1, -5),
            Err(AuthzError::InvalidKey { kind: "member", id: -5 })
        );
        assert!(MemberKey::new(0, 0).is_ok());
    }

    #[test]
    fn test_encoding() {
        assert_eq!(42_i64.encode(), "42");
        assert_eq!(MemberKey::new(42, 99).unwrap().encode(), "42:99");
        assert_eq!(MemberKey::new(42, 99).unwrap().group().as_deref(), Some("42"));
        assert_eq!(42_i64.group(), None);
    }
}
