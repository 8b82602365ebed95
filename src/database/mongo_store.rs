//! MongoDB-backed authority store.
//!
//! Collections:
//! - `guild_profiles` keyed by `guild_id`
//! - `role_ranks` keyed by `(guild_id, role_id)`
//! - `entity_status` keyed by `(guild_id, entity_id)`

use std::collections::BTreeSet;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::Collection;
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::{ReplaceOptions, ReturnDocument};
use tracing::debug;

use super::Database;
use super::models::{
    EntityStatus, EntityStatusRecord, GuildPermissionProfile, Patch, ProfileUpdate,
    RoleRankAssignment,
};
use super::store::AuthorityStore;
use crate::cache::{EntityId, GuildId, RoleId};
use crate::error::{AuthzError, Result};

#[derive(Clone)]
pub struct MongoAuthorityStore {
    profiles: Collection<GuildPermissionProfile>,
    ranks: Collection<RoleRankAssignment>,
    statuses: Collection<EntityStatusRecord>,
}

impl MongoAuthorityStore {
    pub fn new(db: &Database) -> Self {
        Self {
            profiles: db.collection("guild_profiles"),
            ranks: db.collection("role_ranks"),
            statuses: db.collection("entity_status"),
        }
    }
}

fn upsert() -> ReplaceOptions {
    ReplaceOptions::builder().upsert(true).build()
}

/// Split a partial update into `$set` and `$unset` documents.
fn profile_update_doc(update: &ProfileUpdate) -> Document {
    let mut set = Document::new();
    let mut unset = Document::new();
    for (field, patch) in update.fields() {
        match patch {
            Patch::Unset => {}
            Patch::Clear => {
                unset.insert(field, "");
            }
            Patch::Value(id) => {
                set.insert(field, id);
            }
        }
    }

    let mut doc = Document::new();
    if !set.is_empty() {
        doc.insert("$set", set);
    }
    if !unset.is_empty() {
        doc.insert("$unset", unset);
    }
    doc
}

fn guild_ids(values: Vec<Bson>) -> impl Iterator<Item = GuildId> {
    values.into_iter().filter_map(|v| match v {
        Bson::Int64(id) => Some(id),
        Bson::Int32(id) => Some(id as i64),
        _ => None,
    })
}

#[async_trait]
impl AuthorityStore for MongoAuthorityStore {
    async fn fetch_guild_profile(&self, guild_id: GuildId) -> Result<GuildPermissionProfile> {
        let result = self
            .profiles
            .find_one(doc! { "guild_id": guild_id })
            .await
            .map_err(|e| AuthzError::store("fetch_guild_profile", e))?;
        debug!("DB get guild profile for {}: {:?}", guild_id, result.is_some());
        Ok(result.unwrap_or_else(|| GuildPermissionProfile::new(guild_id)))
    }

    async fn fetch_role_assignments(&self, guild_id: GuildId) -> Result<Vec<RoleRankAssignment>> {
        let cursor = self
            .ranks
            .find(doc! { "guild_id": guild_id })
            .await
            .map_err(|e| AuthzError::store("fetch_role_assignments", e))?;
        let assignments: Vec<RoleRankAssignment> = cursor
            .try_collect()
            .await
            .map_err(|e| AuthzError::store("fetch_role_assignments", e))?;
        debug!("DB got {} rank assignments for {}", assignments.len(), guild_id);
        Ok(assignments)
    }

    async fn fetch_entity_status(
        &self,
        guild_id: GuildId,
        entity_id: EntityId,
    ) -> Result<EntityStatus> {
        let result = self
            .statuses
            .find_one(doc! { "guild_id": guild_id, "entity_id": entity_id })
            .await
            .map_err(|e| AuthzError::store("fetch_entity_status", e))?;
        Ok(result.map(|record| record.status).unwrap_or_default())
    }

    async fn known_guilds(&self) -> Result<Vec<GuildId>> {
        let from_profiles = self
            .profiles
            .distinct("guild_id", doc! {})
            .await
            .map_err(|e| AuthzError::store("known_guilds", e))?;
        let from_ranks = self
            .ranks
            .distinct("guild_id", doc! {})
            .await
            .map_err(|e| AuthzError::store("known_guilds", e))?;

        let guilds: BTreeSet<GuildId> = guild_ids(from_profiles).chain(guild_ids(from_ranks)).collect();
        Ok(guilds.into_iter().collect())
    }

    async fn update_guild_profile(
        &self,
        guild_id: GuildId,
        update: &ProfileUpdate,
    ) -> Result<GuildPermissionProfile> {
        let changes = profile_update_doc(update);
        if changes.is_empty() {
            return self.fetch_guild_profile(guild_id).await;
        }

        let profile = self
            .profiles
            .find_one_and_update(doc! { "guild_id": guild_id }, changes)
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
            .map_err(|e| AuthzError::store("update_guild_profile", e))?;

        debug!("Updated guild profile for {}", guild_id);
        Ok(profile.unwrap_or_else(|| GuildPermissionProfile::new(guild_id)))
    }

    async fn upsert_role_rank(&self, assignment: &RoleRankAssignment) -> Result<()> {
        let filter = doc! { "guild_id": assignment.guild_id, "role_id": assignment.role_id };
        let record = RoleRankAssignment {
            id: None,
            ..assignment.clone()
        };
        self.ranks
            .replace_one(filter, &record)
            .with_options(upsert())
            .await
            .map_err(|e| AuthzError::store("upsert_role_rank", e))?;

        debug!(
            "Saved rank {} for role {} in guild {}",
            assignment.rank, assignment.role_id, assignment.guild_id
        );
        Ok(())
    }

    async fn delete_role_rank(&self, guild_id: GuildId, role_id: RoleId) -> Result<bool> {
        let result = self
            .ranks
            .delete_one(doc! { "guild_id": guild_id, "role_id": role_id })
            .await
            .map_err(|e| AuthzError::store("delete_role_rank", e))?;
        Ok(result.deleted_count > 0)
    }

    async fn replace_role_ranks(
        &self,
        guild_id: GuildId,
        assignments: &[RoleRankAssignment],
    ) -> Result<()> {
        // Not transactional: a failure after the delete leaves the guild with
        // no assignments, which resolves everyone to rank 0.
        self.ranks
            .delete_many(doc! { "guild_id": guild_id })
            .await
            .map_err(|e| AuthzError::store("replace_role_ranks", e))?;

        let records: Vec<RoleRankAssignment> = assignments
            .iter()
            .map(|a| RoleRankAssignment::new(guild_id, a.role_id, a.rank))
            .collect();
        if !records.is_empty() {
            self.ranks
                .insert_many(records)
                .await
                .map_err(|e| AuthzError::store("replace_role_ranks", e))?;
        }

        debug!("Replaced {} rank assignments for {}", assignments.len(), guild_id);
        Ok(())
    }

    async fn save_entity_status(
        &self,
        guild_id: GuildId,
        entity_id: EntityId,
        status: Option<EntityStatus>,
    ) -> Result<()> {
        let filter = doc! { "guild_id": guild_id, "entity_id": entity_id };
        match status {
            Some(status) => {
                let record = EntityStatusRecord {
                    id: None,
                    guild_id,
                    entity_id,
                    status,
                };
                self.statuses
                    .replace_one(filter, &record)
                    .with_options(upsert())
                    .await
                    .map_err(|e| AuthzError::store("save_entity_status", e))?;
            }
            None => {
                self.statuses
                    .delete_one(filter)
                    .await
                    .map_err(|e| AuthzError::store("save_entity_status", e))?;
            }
        }
        Ok(())
    }
}
