//! Repository trait for entities and aliases

use async_trait::async_trait;

use crate::error::Result;

use super::entity::{AliasType, Entity, EntityAlias, EntityKind};
use super::merge::{MergeResult, MergeSuggestion, SplitResult, SuggestionStatus};

/// Repository trait for identity persistence
///
/// Aliases are unique per `(workspace, alias_type, value)`; that constraint is what
/// keeps concurrent resolution from creating duplicate entities.
#[async_trait]
pub trait IdentityRepository: Send + Sync {
    // ========== Entity Operations ==========

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>>;

    async fn list_entities(&self, workspace_id: &str, kind: Option<EntityKind>)
    -> Result<Vec<Entity>>;

    /// Create an entity with its aliases in one transaction
    ///
    /// `key_alias` is inserted strictly: if another entity already owns it the whole
    /// insert is rolled back with [`crate::Error::Conflict`]. The remaining aliases are
    /// inserted only where free.
    async fn create_entity(
        &self,
        entity: &Entity,
        key_alias: Option<&EntityAlias>,
        aliases: &[EntityAlias],
    ) -> Result<()>;

    // ========== Alias Operations ==========

    async fn find_alias(
        &self,
        workspace_id: &str,
        alias_type: AliasType,
        value: &str,
    ) -> Result<Option<EntityAlias>>;

    async fn list_aliases(&self, entity_id: &str) -> Result<Vec<EntityAlias>>;

    /// Attach aliases that are still free; returns how many were inserted
    async fn attach_aliases(&self, aliases: &[EntityAlias]) -> Result<usize>;

    /// Entities of a kind owning an email alias in `email_domain`, with all their aliases
    async fn heuristic_candidates(
        &self,
        workspace_id: &str,
        kind: EntityKind,
        email_domain: &str,
    ) -> Result<Vec<(Entity, Vec<EntityAlias>)>>;

    // ========== Merge suggestions ==========

    /// Store a suggestion; open suggestions moving the same entity to different
    /// destinations are all marked conflicted
    async fn save_suggestion(&self, suggestion: &MergeSuggestion) -> Result<MergeSuggestion>;

    async fn list_suggestions(
        &self,
        workspace_id: &str,
        status: Option<SuggestionStatus>,
    ) -> Result<Vec<MergeSuggestion>>;

    // ========== Admin operations ==========

    /// Merge `from_id` into `into_id`: move aliases, rewrite relationship endpoints,
    /// delete the source entity and write an audit record, atomically
    async fn merge_entities(
        &self,
        workspace_id: &str,
        from_id: &str,
        into_id: &str,
        reason: &str,
    ) -> Result<MergeResult>;

    /// Move the given aliases to a new entity of the same kind and audit, atomically
    async fn split_entity(
        &self,
        workspace_id: &str,
        entity_id: &str,
        alias_ids: &[String],
        reason: &str,
    ) -> Result<SplitResult>;
}
