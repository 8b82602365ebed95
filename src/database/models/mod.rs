//! Database model exports.

pub mod entity_status;
pub mod profile;
pub mod role_rank;

pub use entity_status::{EntityStatus, EntityStatusRecord, ModerationState};
pub use profile::{GuildPermissionProfile, Patch, ProfileUpdate};
pub use role_rank::RoleRankAssignment;
