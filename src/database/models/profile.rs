//! Per-guild permission profile and its partial-update type.

use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::cache::{ChannelId, GuildId, RoleId};

/// Per-guild configuration fields used by moderation commands.
///
/// Every field may be unset independently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildPermissionProfile {
    /// MongoDB document ID
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub guild_id: GuildId,

    #[serde(default)]
    pub audit_log_channel_id: Option<ChannelId>,

    #[serde(default)]
    pub mod_log_channel_id: Option<ChannelId>,

    #[serde(default)]
    pub jail_role_id: Option<RoleId>,

    #[serde(default)]
    pub jail_channel_id: Option<ChannelId>,
}

impl GuildPermissionProfile {
    /// Create an empty profile for a guild.
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            ..Default::default()
        }
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, update: &ProfileUpdate) {
        update.audit_log_channel_id.apply(&mut self.audit_log_channel_id);
        update.mod_log_channel_id.apply(&mut self.mod_log_channel_id);
        update.jail_role_id.apply(&mut self.jail_role_id);
        update.jail_channel_id.apply(&mut self.jail_channel_id);
    }
}

/// One field of a partial update.
///
/// `Unset` leaves the stored field alone; `Clear` removes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Patch<T> {
    #[default]
    Unset,
    Clear,
    Value(T),
}

impl<T: Clone> Patch<T> {
    pub fn apply(&self, field: &mut Option<T>) {
        match self {
            Self::Unset => {}
            Self::Clear => *field = None,
            Self::Value(v) => *field = Some(v.clone()),
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }
}

impl<T> From<Option<T>> for Patch<T> {
    /// `Some` sets the field, `None` clears it.
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Self::Value(v),
            None => Self::Clear,
        }
    }
}

/// Partial update of a [`GuildPermissionProfile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub audit_log_channel_id: Patch<ChannelId>,
    pub mod_log_channel_id: Patch<ChannelId>,
    pub jail_role_id: Patch<RoleId>,
    pub jail_channel_id: Patch<ChannelId>,
}

impl ProfileUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn audit_log_channel(mut self, patch: impl Into<Patch<ChannelId>>) -> Self {
        self.audit_log_channel_id = patch.into();
        self
    }

    #[must_use]
    pub fn mod_log_channel(mut self, patch: impl Into<Patch<ChannelId>>) -> Self {
        self.mod_log_channel_id = patch.into();
        self
    }

    #[must_use]
    pub fn jail_role(mut self, patch: impl Into<Patch<RoleId>>) -> Self {
        self.jail_role_id = patch.into();
        self
    }

    #[must_use]
    pub fn jail_channel(mut self, patch: impl Into<Patch<ChannelId>>) -> Self {
        self.jail_channel_id = patch.into();
        self
    }

    /// True when no field is touched.
    pub fn is_empty(&self) -> bool {
        self.fields().iter().all(|(_, patch)| patch.is_unset())
    }

    /// Document field names paired with their patch.
    pub fn fields(&self) -> [(&'static str, Patch<i64>); 4] {
        [
            ("audit_log_channel_id", self.audit_log_channel_id),
            ("mod_log_channel_id", self.mod_log_channel_id),
            ("jail_role_id", self.jail_role_id),
            ("jail_channel_id", self.jail_channel_id),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_distinguishes_unset_and_clear() {
        let mut field = Some(5);
        Patch::Unset.apply(&mut field);
        assert_eq!(field, Some(5));
        Patch::Clear.apply(&mut field);
        assert_eq!(field, None);
        Patch::Value(9).apply(&mut field);
        assert_eq!(field, Some(9));
    }

    #[test]
    fn test_apply_leaves_other_fields() {
        let mut profile = GuildPermissionProfile::new(1);
        profile.apply(&ProfileUpdate::new().audit_log_channel(Patch::Value(5)));
        profile.apply(&ProfileUpdate::new().mod_log_channel(Some(9)));

        assert_eq!(profile.audit_log_channel_id, Some(5));
        assert_eq!(profile.mod_log_channel_id, Some(9));
        assert_eq!(profile.jail_role_id, None);

        profile.apply(&ProfileUpdate::new().audit_log_channel(Patch::Clear));
        assert_eq!(profile.audit_log_channel_id, None);
        assert_eq!(profile.mod_log_channel_id, Some(9));
    }

    #[test]
    fn test_is_empty() {
        assert!(ProfileUpdate::new().is_empty());
        assert!(!ProfileUpdate::new().jail_role(Patch::Clear).is_empty());
    }
}
