//! SQLite implementation of the IdentityRepository
//!
//! Merge and split run in a single transaction together with their audit record.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::domain::audit::{AuditOperation, AuditRecord};
use crate::domain::identity::{
    AliasType, Entity, EntityAlias, EntityKind, IdentityRepository, MergeResult, MergeSuggestion,
    SplitResult, SuggestionStatus,
};
use crate::error::{Error, Result, is_unique_violation};

use super::{from_json, insert_audit, parse_timestamp, timestamp, to_json};

#[derive(Clone)]
pub struct SqliteIdentityRepository {
    pool: SqlitePool,
}

impl SqliteIdentityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

async fn insert_alias(conn: &mut SqliteConnection, alias: &EntityAlias, strict: bool) -> Result<u64> {
    let sql = if strict {
        r#"
        INSERT INTO entity_aliases (
            id, entity_id, workspace_id, alias_type, value, provider, verified, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#
    } else {
        r#"
        INSERT INTO entity_aliases (
            id, entity_id, workspace_id, alias_type, value, provider, verified, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(workspace_id, alias_type, value) DO NOTHING
        "#
    };

    let result = sqlx::query(sql)
        .bind(&alias.id)
        .bind(&alias.entity_id)
        .bind(&alias.workspace_id)
        .bind(alias.alias_type.as_str())
        .bind(&alias.value)
        .bind(&alias.provider)
        .bind(alias.verified)
        .bind(timestamp(&alias.created_at))
        .execute(conn)
        .await;

    match result {
        Ok(done) => Ok(done.rows_affected()),
        Err(e) if is_unique_violation(&e) => Err(Error::Conflict(format!(
            "{} alias {}",
            alias.alias_type.as_str(),
            alias.value
        ))),
        Err(e) => Err(e.into()),
    }
}

async fn fetch_entity(
    conn: &mut SqliteConnection,
    workspace_id: &str,
    id: &str,
) -> Result<Entity> {
    let row: Option<EntityRow> =
        sqlx::query_as("SELECT * FROM entities WHERE id = ? AND workspace_id = ?")
            .bind(id)
            .bind(workspace_id)
            .fetch_optional(conn)
            .await?;

    row.ok_or_else(|| Error::EntityNotFound(id.to_string()))?
        .into_entity()
}

#[derive(Debug, FromRow)]
struct EndpointRow {
    id: String,
    from_kind: String,
    from_id: String,
    to_kind: String,
    to_id: String,
    relationship_type: String,
    source: String,
    confidence: f32,
}

/// Rewrite every relationship touching entity `from_id` to point at `into_id`
///
/// Rows that would collide with an existing relationship are folded into it (evidence
/// moved, higher confidence kept); rows that would become self-loops are dropped.
async fn rewrite_endpoints(
    conn: &mut SqliteConnection,
    workspace_id: &str,
    from_id: &str,
    into_id: &str,
) -> Result<(usize, usize)> {
    let rows: Vec<EndpointRow> = sqlx::query_as(
        r#"
        SELECT id, from_kind, from_id, to_kind, to_id, relationship_type, source, confidence
        FROM relationships
        WHERE workspace_id = ?
          AND ((from_kind = 'entity' AND from_id = ?) OR (to_kind = 'entity' AND to_id = ?))
        "#,
    )
    .bind(workspace_id)
    .bind(from_id)
    .bind(from_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut rewritten = 0;
    let mut dropped = 0;

    for row in rows {
        let new_from = if row.from_kind == "entity" && row.from_id == from_id {
            into_id
        } else {
            row.from_id.as_str()
        };
        let new_to = if row.to_kind == "entity" && row.to_id == from_id {
            into_id
        } else {
            row.to_id.as_str()
        };

        if new_from == new_to {
            sqlx::query("DELETE FROM relationships WHERE id = ?")
                .bind(&row.id)
                .execute(&mut *conn)
                .await?;
            dropped += 1;
            continue;
        }

        let existing: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM relationships
            WHERE workspace_id = ? AND from_id = ? AND to_id = ?
              AND relationship_type = ? AND source = ? AND id != ?
            "#,
        )
        .bind(workspace_id)
        .bind(new_from)
        .bind(new_to)
        .bind(&row.relationship_type)
        .bind(&row.source)
        .bind(&row.id)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some((existing_id,)) = existing {
            sqlx::query(
                "UPDATE OR IGNORE relationship_evidence SET relationship_id = ? WHERE relationship_id = ?",
            )
            .bind(&existing_id)
            .bind(&row.id)
            .execute(&mut *conn)
            .await?;
            sqlx::query("UPDATE relationships SET confidence = MAX(confidence, ?), updated_at = ? WHERE id = ?")
                .bind(row.confidence)
                .bind(timestamp(&Utc::now()))
                .bind(&existing_id)
                .execute(&mut *conn)
                .await?;
            sqlx::query("DELETE FROM relationships WHERE id = ?")
                .bind(&row.id)
                .execute(&mut *conn)
                .await?;
            dropped += 1;
        } else {
            sqlx::query("UPDATE relationships SET from_id = ?, to_id = ?, updated_at = ? WHERE id = ?")
                .bind(new_from)
                .bind(new_to)
                .bind(timestamp(&Utc::now()))
                .bind(&row.id)
                .execute(&mut *conn)
                .await?;
            rewritten += 1;
        }
    }

    // Review items follow the entity; collisions and self-loops are dropped
    sqlx::query(
        "UPDATE OR IGNORE review_queue SET from_id = ? WHERE workspace_id = ? AND from_kind = 'entity' AND from_id = ?",
    )
    .bind(into_id)
    .bind(workspace_id)
    .bind(from_id)
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "UPDATE OR IGNORE review_queue SET to_id = ? WHERE workspace_id = ? AND to_kind = 'entity' AND to_id = ?",
    )
    .bind(into_id)
    .bind(workspace_id)
    .bind(from_id)
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "DELETE FROM review_queue WHERE workspace_id = ? AND (from_id = ? OR to_id = ? OR from_id = to_id)",
    )
    .bind(workspace_id)
    .bind(from_id)
    .bind(from_id)
    .execute(&mut *conn)
    .await?;

    Ok((rewritten, dropped))
}

#[async_trait]
impl IdentityRepository for SqliteIdentityRepository {
    async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        let row: Option<EntityRow> = sqlx::query_as("SELECT * FROM entities WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_entity()).transpose()
    }

    async fn list_entities(
        &self,
        workspace_id: &str,
        kind: Option<EntityKind>,
    ) -> Result<Vec<Entity>> {
        let rows: Vec<EntityRow> = match kind {
            Some(kind) => {
                sqlx::query_as(
                    "SELECT * FROM entities WHERE workspace_id = ? AND kind = ? ORDER BY display_name, id",
                )
                .bind(workspace_id)
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM entities WHERE workspace_id = ? ORDER BY kind, display_name, id",
                )
                .bind(workspace_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(|r| r.into_entity()).collect()
    }

    async fn create_entity(
        &self,
        entity: &Entity,
        key_alias: Option<&EntityAlias>,
        aliases: &[EntityAlias],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO entities (id, workspace_id, kind, display_name, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entity.id)
        .bind(&entity.workspace_id)
        .bind(entity.kind.as_str())
        .bind(&entity.display_name)
        .bind(timestamp(&entity.created_at))
        .bind(timestamp(&entity.updated_at))
        .execute(&mut *tx)
        .await?;

        if let Some(key) = key_alias {
            insert_alias(&mut tx, key, true).await?;
        }
        for alias in aliases {
            insert_alias(&mut tx, alias, false).await?;
        }

        tx.commit().await?;

        debug!(entity_id = %entity.id, kind = %entity.kind, "Entity saved");
        Ok(())
    }

    async fn find_alias(
        &self,
        workspace_id: &str,
        alias_type: AliasType,
        value: &str,
    ) -> Result<Option<EntityAlias>> {
        let row: Option<AliasRow> = sqlx::query_as(
            "SELECT * FROM entity_aliases WHERE workspace_id = ? AND alias_type = ? AND value = ?",
        )
        .bind(workspace_id)
        .bind(alias_type.as_str())
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_alias()).transpose()
    }

    async fn list_aliases(&self, entity_id: &str) -> Result<Vec<EntityAlias>> {
        let rows: Vec<AliasRow> = sqlx::query_as(
            "SELECT * FROM entity_aliases WHERE entity_id = ? ORDER BY alias_type, value",
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_alias()).collect()
    }

    async fn attach_aliases(&self, aliases: &[EntityAlias]) -> Result<usize> {
        let mut conn = self.pool.acquire().await?;
        let mut inserted = 0;
        for alias in aliases {
            inserted += insert_alias(&mut conn, alias, false).await? as usize;
        }
        Ok(inserted)
    }

    async fn heuristic_candidates(
        &self,
        workspace_id: &str,
        kind: EntityKind,
        email_domain: &str,
    ) -> Result<Vec<(Entity, Vec<EntityAlias>)>> {
        let rows: Vec<EntityRow> = sqlx::query_as(
            r#"
            SELECT DISTINCT e.* FROM entities e
            JOIN entity_aliases a ON a.entity_id = e.id
            WHERE e.workspace_id = ? AND e.kind = ? AND a.alias_type = 'email'
              AND substr(a.value, instr(a.value, '@') + 1) = ?
            ORDER BY e.id
            "#,
        )
        .bind(workspace_id)
        .bind(kind.as_str())
        .bind(email_domain.to_lowercase())
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let entity = row.into_entity()?;
            let aliases = self.list_aliases(&entity.id).await?;
            candidates.push((entity, aliases));
        }
        Ok(candidates)
    }

    async fn save_suggestion(&self, suggestion: &MergeSuggestion) -> Result<MergeSuggestion> {
        let signals = to_json(&suggestion.signals, "signals")?;
        let now = timestamp(&Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO merge_suggestions (
                id, workspace_id, entity_id, candidate_entity_id, confidence, signals,
                status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(workspace_id, entity_id, candidate_entity_id) DO UPDATE SET
                confidence = excluded.confidence,
                signals = excluded.signals,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&suggestion.id)
        .bind(&suggestion.workspace_id)
        .bind(&suggestion.entity_id)
        .bind(&suggestion.candidate_entity_id)
        .bind(suggestion.confidence)
        .bind(&signals)
        .bind(suggestion.status.as_str())
        .bind(timestamp(&suggestion.created_at))
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        // The same entity suggested into different destinations needs a human decision
        let (destinations,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(DISTINCT candidate_entity_id) FROM merge_suggestions
            WHERE workspace_id = ? AND entity_id = ? AND status IN ('open', 'conflicted')
            "#,
        )
        .bind(&suggestion.workspace_id)
        .bind(&suggestion.entity_id)
        .fetch_one(&mut *tx)
        .await?;

        if destinations > 1 {
            sqlx::query(
                r#"
                UPDATE merge_suggestions SET status = 'conflicted', updated_at = ?
                WHERE workspace_id = ? AND entity_id = ? AND status = 'open'
                "#,
            )
            .bind(&now)
            .bind(&suggestion.workspace_id)
            .bind(&suggestion.entity_id)
            .execute(&mut *tx)
            .await?;
            info!(
                entity_id = %suggestion.entity_id,
                destinations = destinations,
                "Conflicting merge suggestions flagged"
            );
        }

        let row: SuggestionRow = sqlx::query_as(
            r#"
            SELECT * FROM merge_suggestions
            WHERE workspace_id = ? AND entity_id = ? AND candidate_entity_id = ?
            "#,
        )
        .bind(&suggestion.workspace_id)
        .bind(&suggestion.entity_id)
        .bind(&suggestion.candidate_entity_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        row.into_suggestion()
    }

    async fn list_suggestions(
        &self,
        workspace_id: &str,
        status: Option<SuggestionStatus>,
    ) -> Result<Vec<MergeSuggestion>> {
        let rows: Vec<SuggestionRow> = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT * FROM merge_suggestions WHERE workspace_id = ? AND status = ? ORDER BY confidence DESC, id",
                )
                .bind(workspace_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM merge_suggestions WHERE workspace_id = ? ORDER BY confidence DESC, id",
                )
                .bind(workspace_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(|r| r.into_suggestion()).collect()
    }

    async fn merge_entities(
        &self,
        workspace_id: &str,
        from_id: &str,
        into_id: &str,
        reason: &str,
    ) -> Result<MergeResult> {
        if from_id == into_id {
            return Err(Error::Validation("cannot merge an entity into itself".to_string()));
        }

        let mut tx = self.pool.begin().await?;
        let from = fetch_entity(&mut tx, workspace_id, from_id).await?;
        let into = fetch_entity(&mut tx, workspace_id, into_id).await?;
        if from.kind != into.kind {
            return Err(Error::Validation(format!(
                "cannot merge a {} into a {}",
                from.kind, into.kind
            )));
        }

        let moved = sqlx::query("UPDATE entity_aliases SET entity_id = ? WHERE entity_id = ?")
            .bind(into_id)
            .bind(from_id)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;

        let (rewritten, dropped) = rewrite_endpoints(&mut tx, workspace_id, from_id, into_id).await?;

        let now = timestamp(&Utc::now());
        sqlx::query(
            r#"
            UPDATE merge_suggestions SET status = 'applied', updated_at = ?
            WHERE workspace_id = ? AND status IN ('open', 'conflicted')
              AND ((entity_id = ? AND candidate_entity_id = ?) OR (entity_id = ? AND candidate_entity_id = ?))
            "#,
        )
        .bind(&now)
        .bind(workspace_id)
        .bind(from_id)
        .bind(into_id)
        .bind(into_id)
        .bind(from_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            UPDATE merge_suggestions SET status = 'dismissed', updated_at = ?
            WHERE workspace_id = ? AND status IN ('open', 'conflicted')
              AND (entity_id = ? OR candidate_entity_id = ?)
            "#,
        )
        .bind(&now)
        .bind(workspace_id)
        .bind(from_id)
        .bind(from_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM entities WHERE id = ?")
            .bind(from_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE entities SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(into_id)
            .execute(&mut *tx)
            .await?;

        let audit = AuditRecord::new(
            workspace_id,
            AuditOperation::MergeEntities,
            vec![from_id.to_string(), into_id.to_string()],
            reason,
        )
        .with_detail(json!({
            "aliases_moved": moved,
            "relationships_rewritten": rewritten,
            "relationships_dropped": dropped,
            "from_display_name": from.display_name,
        }));
        insert_audit(&mut tx, &audit).await?;

        tx.commit().await?;

        info!(
            from_entity_id = %from_id,
            into_entity_id = %into_id,
            aliases_moved = moved,
            relationships_rewritten = rewritten,
            relationships_dropped = dropped,
            "Entities merged"
        );

        Ok(MergeResult {
            from_entity_id: from_id.to_string(),
            into_entity_id: into_id.to_string(),
            aliases_moved: moved,
            relationships_rewritten: rewritten,
            relationships_dropped: dropped,
            audit_id: audit.id,
        })
    }

    async fn split_entity(
        &self,
        workspace_id: &str,
        entity_id: &str,
        alias_ids: &[String],
        reason: &str,
    ) -> Result<SplitResult> {
        if alias_ids.is_empty() {
            return Err(Error::Validation("split needs at least one alias to move".to_string()));
        }

        let mut tx = self.pool.begin().await?;
        let original = fetch_entity(&mut tx, workspace_id, entity_id).await?;

        let rows: Vec<AliasRow> = sqlx::query_as("SELECT * FROM entity_aliases WHERE entity_id = ?")
            .bind(entity_id)
            .fetch_all(&mut *tx)
            .await?;
        let owned: Vec<EntityAlias> = rows
            .into_iter()
            .map(|r| r.into_alias())
            .collect::<Result<_>>()?;

        let mut moving = Vec::new();
        for id in alias_ids {
            let alias = owned
                .iter()
                .find(|a| &a.id == id)
                .ok_or_else(|| Error::AliasNotFound(id.clone()))?;
            moving.push(alias);
        }

        let display_name = moving
            .iter()
            .find_map(|a| a.handle().map(str::to_string))
            .or_else(|| {
                moving
                    .iter()
                    .find(|a| a.alias_type == AliasType::Email)
                    .map(|a| a.value.clone())
            })
            .unwrap_or_else(|| format!("{} (split)", original.display_name));
        let new_entity = Entity::new(workspace_id, original.kind, display_name);

        sqlx::query(
            r#"
            INSERT INTO entities (id, workspace_id, kind, display_name, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new_entity.id)
        .bind(&new_entity.workspace_id)
        .bind(new_entity.kind.as_str())
        .bind(&new_entity.display_name)
        .bind(timestamp(&new_entity.created_at))
        .bind(timestamp(&new_entity.updated_at))
        .execute(&mut *tx)
        .await?;

        for alias in &moving {
            sqlx::query("UPDATE entity_aliases SET entity_id = ? WHERE id = ?")
                .bind(&new_entity.id)
                .bind(&alias.id)
                .execute(&mut *tx)
                .await?;
        }

        let audit = AuditRecord::new(
            workspace_id,
            AuditOperation::SplitEntity,
            vec![entity_id.to_string(), new_entity.id.clone()],
            reason,
        )
        .with_detail(json!({ "alias_ids": alias_ids }));
        insert_audit(&mut tx, &audit).await?;

        tx.commit().await?;

        info!(
            entity_id = %entity_id,
            new_entity_id = %new_entity.id,
            aliases_moved = moving.len(),
            "Entity split"
        );

        Ok(SplitResult {
            original_entity_id: entity_id.to_string(),
            aliases_moved: moving.len(),
            new_entity,
            audit_id: audit.id,
        })
    }
}

#[derive(Debug, FromRow)]
struct EntityRow {
    id: String,
    workspace_id: String,
    kind: String,
    display_name: String,
    created_at: String,
    updated_at: String,
}

impl EntityRow {
    fn into_entity(self) -> Result<Entity> {
        let kind = EntityKind::parse(&self.kind)
            .ok_or_else(|| Error::Other(format!("Invalid entity kind: {}", self.kind)))?;

        Ok(Entity {
            id: self.id,
            workspace_id: self.workspace_id,
            kind,
            display_name: self.display_name,
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
        })
    }
}

#[derive(Debug, FromRow)]
struct AliasRow {
    id: String,
    entity_id: String,
    workspace_id: String,
    alias_type: String,
    value: String,
    provider: Option<String>,
    verified: bool,
    created_at: String,
}

impl AliasRow {
    fn into_alias(self) -> Result<EntityAlias> {
        let alias_type = AliasType::parse(&self.alias_type)
            .ok_or_else(|| Error::Other(format!("Invalid alias type: {}", self.alias_type)))?;

        Ok(EntityAlias {
            id: self.id,
            entity_id: self.entity_id,
            workspace_id: self.workspace_id,
            alias_type,
            value: self.value,
            provider: self.provider,
            verified: self.verified,
            created_at: parse_timestamp(&self.created_at),
        })
    }
}

#[derive(Debug, FromRow)]
struct SuggestionRow {
    id: String,
    workspace_id: String,
    entity_id: String,
    candidate_entity_id: String,
    confidence: f32,
    signals: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl SuggestionRow {
    fn into_suggestion(self) -> Result<MergeSuggestion> {
        let status = SuggestionStatus::parse(&self.status)
            .ok_or_else(|| Error::Other(format!("Invalid suggestion status: {}", self.status)))?;

        Ok(MergeSuggestion {
            id: self.id,
            workspace_id: self.workspace_id,
            entity_id: self.entity_id,
            candidate_entity_id: self.candidate_entity_id,
            confidence: self.confidence,
            signals: from_json(&self.signals),
            status,
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
        })
    }
}
