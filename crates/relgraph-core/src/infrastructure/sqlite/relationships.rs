//! SQLite implementation of the RelationshipRepository
//!
//! All resolved edges go through [`guarded_write`], which runs inside the caller's
//! transaction and writes the forward and reverse rows together.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::documents::DocumentKey;
use crate::domain::relationships::{
    Direction, Endpoint, NodeKind, PairWrite, PendingRelationship, PendingStatus, Relationship,
    RelationshipEvidence, RelationshipRepository, RelationshipSource, RelationshipStats,
    RelationshipStatus, RelationshipType, ReviewItem, ReviewStatus, WriteOutcome,
};
use crate::error::{Error, Result};

use super::{from_json, parse_timestamp, timestamp, to_json};

#[derive(Clone)]
pub struct SqliteRelationshipRepository {
    pool: SqlitePool,
}

impl SqliteRelationshipRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

async fn find_edge(
    conn: &mut SqliteConnection,
    workspace_id: &str,
    from_id: &str,
    to_id: &str,
    relationship_type: RelationshipType,
    source: RelationshipSource,
) -> Result<Option<Relationship>> {
    let row: Option<RelationshipRow> = sqlx::query_as(
        r#"
        SELECT * FROM relationships
        WHERE workspace_id = ? AND from_id = ? AND to_id = ?
          AND relationship_type = ? AND source = ?
        "#,
    )
    .bind(workspace_id)
    .bind(from_id)
    .bind(to_id)
    .bind(relationship_type.as_str())
    .bind(source.as_str())
    .fetch_optional(conn)
    .await?;

    row.map(|r| r.into_relationship()).transpose()
}

async fn insert_edge(conn: &mut SqliteConnection, relationship: &Relationship) -> Result<bool> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO relationships (
            id, workspace_id, from_kind, from_id, to_kind, to_id, relationship_type,
            confidence, source, status, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(workspace_id, from_id, to_id, relationship_type, source) DO NOTHING
        "#,
    )
    .bind(&relationship.id)
    .bind(&relationship.workspace_id)
    .bind(relationship.from.kind.as_str())
    .bind(&relationship.from.id)
    .bind(relationship.to.kind.as_str())
    .bind(&relationship.to.id)
    .bind(relationship.relationship_type.as_str())
    .bind(relationship.confidence)
    .bind(relationship.source.as_str())
    .bind(relationship.status.as_str())
    .bind(timestamp(&relationship.created_at))
    .bind(timestamp(&relationship.updated_at))
    .execute(conn)
    .await?
    .rows_affected();

    Ok(inserted > 0)
}

async fn insert_evidence(
    conn: &mut SqliteConnection,
    relationship_id: &str,
    evidence: &[RelationshipEvidence],
) -> Result<()> {
    let now = timestamp(&Utc::now());
    for item in evidence {
        sqlx::query(
            r#"
            INSERT INTO relationship_evidence (
                id, relationship_id, quote, chunk_ref, reasoning, weight, rule, fingerprint, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(relationship_id, fingerprint) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(relationship_id)
        .bind(&item.quote)
        .bind(&item.chunk_ref)
        .bind(&item.reasoning)
        .bind(item.weight)
        .bind(&item.rule)
        .bind(item.fingerprint())
        .bind(&now)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn load_evidence(
    conn: &mut SqliteConnection,
    relationship_id: &str,
) -> Result<Vec<RelationshipEvidence>> {
    let rows: Vec<EvidenceRow> = sqlx::query_as(
        "SELECT * FROM relationship_evidence WHERE relationship_id = ? ORDER BY created_at, id",
    )
    .bind(relationship_id)
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().map(|r| r.into_evidence()).collect())
}

/// Remove the semantic pair a deterministic write replaces
async fn supersede_semantic(
    conn: &mut SqliteConnection,
    relationship: &Relationship,
) -> Result<Vec<Relationship>> {
    let mut superseded = Vec::new();
    let candidates = [
        (&relationship.from.id, &relationship.to.id, relationship.relationship_type),
        (
            &relationship.to.id,
            &relationship.from.id,
            relationship.relationship_type.inverse(),
        ),
    ];

    for (from_id, to_id, relationship_type) in candidates {
        if let Some(edge) = find_edge(
            &mut *conn,
            &relationship.workspace_id,
            from_id,
            to_id,
            relationship_type,
            RelationshipSource::Semantic,
        )
        .await?
        {
            sqlx::query("DELETE FROM relationships WHERE id = ?")
                .bind(&edge.id)
                .execute(&mut *conn)
                .await?;
            superseded.push(edge);
        }
    }
    Ok(superseded)
}

/// The single guarded write path for resolved pairs
///
/// Rejects self-loops, lets deterministic edges win over semantic and manual ones, and
/// inserts forward and reverse rows idempotently.
async fn guarded_write(conn: &mut SqliteConnection, relationship: &Relationship) -> Result<PairWrite> {
    if relationship.is_self_loop() {
        return Err(Error::Validation(format!(
            "relationship from {} to itself",
            relationship.from
        )));
    }

    let mut superseded = Vec::new();
    if relationship.source == RelationshipSource::Deterministic {
        superseded = supersede_semantic(&mut *conn, relationship).await?;
    } else if find_edge(
        &mut *conn,
        &relationship.workspace_id,
        &relationship.from.id,
        &relationship.to.id,
        relationship.relationship_type,
        RelationshipSource::Deterministic,
    )
    .await?
    .is_some()
    {
        debug!(
            from = %relationship.from,
            to = %relationship.to,
            relationship_type = %relationship.relationship_type,
            source = relationship.source.as_str(),
            "Write rejected, deterministic edge exists"
        );
        return Ok(PairWrite::rejected());
    }

    let reverse = relationship.reverse();
    let created = insert_edge(&mut *conn, relationship).await?;
    // Also repairs a missing reverse row
    insert_edge(&mut *conn, &reverse).await?;

    let missing = || Error::Fatal("relationship pair vanished inside its transaction".to_string());
    let mut forward = find_edge(
        &mut *conn,
        &relationship.workspace_id,
        &relationship.from.id,
        &relationship.to.id,
        relationship.relationship_type,
        relationship.source,
    )
    .await?
    .ok_or_else(missing)?;
    let mut stored_reverse = find_edge(
        &mut *conn,
        &reverse.workspace_id,
        &reverse.from.id,
        &reverse.to.id,
        reverse.relationship_type,
        reverse.source,
    )
    .await?
    .ok_or_else(missing)?;

    let outcome = if created {
        WriteOutcome::Created
    } else if relationship.confidence > forward.confidence {
        let now = Utc::now();
        sqlx::query("UPDATE relationships SET confidence = ?, updated_at = ? WHERE id IN (?, ?)")
            .bind(relationship.confidence)
            .bind(timestamp(&now))
            .bind(&forward.id)
            .bind(&stored_reverse.id)
            .execute(&mut *conn)
            .await?;
        forward.confidence = relationship.confidence;
        forward.updated_at = now;
        stored_reverse.confidence = relationship.confidence;
        stored_reverse.updated_at = now;
        WriteOutcome::Updated
    } else {
        WriteOutcome::Unchanged
    };

    insert_evidence(&mut *conn, &forward.id, &relationship.evidence).await?;
    insert_evidence(&mut *conn, &stored_reverse.id, &relationship.evidence).await?;
    forward.evidence = relationship.evidence.clone();
    stored_reverse.evidence = relationship.evidence.clone();

    Ok(PairWrite {
        outcome,
        forward: Some(forward),
        reverse: Some(stored_reverse),
        superseded,
    })
}

#[async_trait]
impl RelationshipRepository for SqliteRelationshipRepository {
    async fn write_pair(&self, relationship: &Relationship) -> Result<PairWrite> {
        let mut tx = self.pool.begin().await?;
        let write = guarded_write(&mut tx, relationship).await?;
        tx.commit().await?;

        if write.outcome != WriteOutcome::Unchanged {
            debug!(
                relationship_type = %relationship.relationship_type,
                from = %relationship.from,
                to = %relationship.to,
                source = relationship.source.as_str(),
                outcome = ?write.outcome,
                superseded = write.superseded.len(),
                "Relationship pair written"
            );
        }
        Ok(write)
    }

    async fn promote_pending(
        &self,
        pending: &PendingRelationship,
        target: &Endpoint,
    ) -> Result<Option<PairWrite>> {
        let mut tx = self.pool.begin().await?;

        let still_there: Option<(String,)> =
            sqlx::query_as("SELECT id FROM pending_relationships WHERE id = ?")
                .bind(&pending.id)
                .fetch_optional(&mut *tx)
                .await?;
        if still_there.is_none() {
            return Ok(None);
        }

        let relationship = Relationship::new(
            &pending.workspace_id,
            Endpoint::document(&pending.from_document_id),
            target.clone(),
            pending.relationship_type,
            pending.source,
        )
        .with_confidence(pending.confidence)
        .with_evidence(pending.evidence.clone());

        let write = if relationship.is_self_loop() {
            PairWrite::rejected()
        } else {
            guarded_write(&mut tx, &relationship).await?
        };

        // A rejected row would be rejected again on every delivery
        sqlx::query("DELETE FROM pending_relationships WHERE id = ?")
            .bind(&pending.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            pending_id = %pending.id,
            target = %target,
            outcome = ?write.outcome,
            "Pending relationship promoted"
        );
        Ok(Some(write))
    }

    async fn get_relationship(&self, id: &str) -> Result<Option<Relationship>> {
        let mut conn = self.pool.acquire().await?;
        let row: Option<RelationshipRow> = sqlx::query_as("SELECT * FROM relationships WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut relationship = row.into_relationship()?;
        relationship.evidence = load_evidence(&mut conn, &relationship.id).await?;
        Ok(Some(relationship))
    }

    async fn get_relationships(
        &self,
        workspace_id: &str,
        node_id: &str,
        direction: Direction,
        type_filter: &[RelationshipType],
    ) -> Result<Vec<Relationship>> {
        let mut conn = self.pool.acquire().await?;
        let rows: Vec<RelationshipRow> = match direction {
            Direction::Outgoing => {
                sqlx::query_as(
                    "SELECT * FROM relationships WHERE workspace_id = ? AND from_id = ? ORDER BY confidence DESC, id",
                )
                .bind(workspace_id)
                .bind(node_id)
                .fetch_all(&mut *conn)
                .await?
            }
            Direction::Incoming => {
                sqlx::query_as(
                    "SELECT * FROM relationships WHERE workspace_id = ? AND to_id = ? ORDER BY confidence DESC, id",
                )
                .bind(workspace_id)
                .bind(node_id)
                .fetch_all(&mut *conn)
                .await?
            }
            Direction::Both => {
                sqlx::query_as(
                    "SELECT * FROM relationships WHERE workspace_id = ? AND (from_id = ? OR to_id = ?) ORDER BY confidence DESC, id",
                )
                .bind(workspace_id)
                .bind(node_id)
                .bind(node_id)
                .fetch_all(&mut *conn)
                .await?
            }
        };

        let mut relationships = Vec::with_capacity(rows.len());
        for row in rows {
            let mut relationship = row.into_relationship()?;
            if !type_filter.is_empty() && !type_filter.contains(&relationship.relationship_type) {
                continue;
            }
            relationship.evidence = load_evidence(&mut conn, &relationship.id).await?;
            relationships.push(relationship);
        }
        Ok(relationships)
    }

    async fn list_workspace_relationships(&self, workspace_id: &str) -> Result<Vec<Relationship>> {
        let rows: Vec<RelationshipRow> =
            sqlx::query_as("SELECT * FROM relationships WHERE workspace_id = ? ORDER BY created_at, id")
                .bind(workspace_id)
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(|r| r.into_relationship()).collect()
    }

    async fn list_workspaces(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT workspace_id FROM relationships ORDER BY workspace_id")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(ws,)| ws).collect())
    }

    async fn count_relationships(&self, workspace_id: &str) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM relationships WHERE workspace_id = ?")
                .bind(workspace_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count.max(0) as u64)
    }

    async fn save_pending(&self, pending: &PendingRelationship) -> Result<PendingRelationship> {
        let evidence = to_json(&pending.evidence, "pending evidence")?;

        sqlx::query(
            r#"
            INSERT INTO pending_relationships (
                id, workspace_id, from_document_id, target_source_type, target_source_id,
                relationship_type, confidence, source, evidence, retry_count, status,
                last_error, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(workspace_id, from_document_id, target_source_type, target_source_id, relationship_type, source)
            DO UPDATE SET
                confidence = MAX(pending_relationships.confidence, excluded.confidence),
                evidence = excluded.evidence,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&pending.id)
        .bind(&pending.workspace_id)
        .bind(&pending.from_document_id)
        .bind(&pending.target.source_type)
        .bind(&pending.target.source_id)
        .bind(pending.relationship_type.as_str())
        .bind(pending.confidence)
        .bind(pending.source.as_str())
        .bind(&evidence)
        .bind(pending.retry_count as i64)
        .bind(pending.status.as_str())
        .bind(&pending.last_error)
        .bind(timestamp(&pending.created_at))
        .bind(timestamp(&pending.updated_at))
        .execute(&self.pool)
        .await?;

        let row: PendingRow = sqlx::query_as(
            r#"
            SELECT * FROM pending_relationships
            WHERE workspace_id = ? AND from_document_id = ? AND target_source_type = ?
              AND target_source_id = ? AND relationship_type = ? AND source = ?
            "#,
        )
        .bind(&pending.workspace_id)
        .bind(&pending.from_document_id)
        .bind(&pending.target.source_type)
        .bind(&pending.target.source_id)
        .bind(pending.relationship_type.as_str())
        .bind(pending.source.as_str())
        .fetch_one(&self.pool)
        .await?;

        row.into_pending()
    }

    async fn pending_for_target(
        &self,
        workspace_id: &str,
        target: &DocumentKey,
    ) -> Result<Vec<PendingRelationship>> {
        let rows: Vec<PendingRow> = sqlx::query_as(
            r#"
            SELECT * FROM pending_relationships
            WHERE workspace_id = ? AND target_source_type = ? AND target_source_id = ?
            ORDER BY created_at, id
            "#,
        )
        .bind(workspace_id)
        .bind(&target.source_type)
        .bind(&target.source_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_pending()).collect()
    }

    async fn list_pending(&self, workspace_id: &str) -> Result<Vec<PendingRelationship>> {
        let rows: Vec<PendingRow> = sqlx::query_as(
            "SELECT * FROM pending_relationships WHERE workspace_id = ? ORDER BY created_at, id",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_pending()).collect()
    }

    async fn record_pending_failure(&self, pending_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pending_relationships
            SET retry_count = retry_count + 1, status = 'retrying', last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(timestamp(&Utc::now()))
        .bind(pending_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enqueue_review(&self, item: &ReviewItem) -> Result<Option<ReviewItem>> {
        let evidence = to_json(&item.evidence, "review evidence")?;
        let mut tx = self.pool.begin().await?;

        if find_edge(
            &mut *tx,
            &item.workspace_id,
            &item.from.id,
            &item.to.id,
            item.relationship_type,
            RelationshipSource::Deterministic,
        )
        .await?
        .is_some()
        {
            debug!(
                from = %item.from,
                to = %item.to,
                relationship_type = %item.relationship_type,
                "Review rejected, deterministic edge exists"
            );
            return Ok(None);
        }

        // Decided items stay decided; an open item takes the newest proposal
        sqlx::query(
            r#"
            INSERT INTO review_queue (
                id, workspace_id, from_kind, from_id, to_kind, to_id, relationship_type,
                confidence, source, evidence, status, created_at, decided_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(workspace_id, from_id, to_id, relationship_type) DO UPDATE SET
                confidence = excluded.confidence,
                evidence = excluded.evidence
            WHERE review_queue.status = 'open'
            "#,
        )
        .bind(&item.id)
        .bind(&item.workspace_id)
        .bind(item.from.kind.as_str())
        .bind(&item.from.id)
        .bind(item.to.kind.as_str())
        .bind(&item.to.id)
        .bind(item.relationship_type.as_str())
        .bind(item.confidence)
        .bind(item.source.as_str())
        .bind(&evidence)
        .bind(item.status.as_str())
        .bind(timestamp(&item.created_at))
        .bind(item.decided_at.as_ref().map(timestamp))
        .execute(&mut *tx)
        .await?;

        let row: ReviewRow = sqlx::query_as(
            r#"
            SELECT * FROM review_queue
            WHERE workspace_id = ? AND from_id = ? AND to_id = ? AND relationship_type = ?
            "#,
        )
        .bind(&item.workspace_id)
        .bind(&item.from.id)
        .bind(&item.to.id)
        .bind(item.relationship_type.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        row.into_item().map(Some)
    }

    async fn get_review_item(&self, id: &str) -> Result<Option<ReviewItem>> {
        let row: Option<ReviewRow> = sqlx::query_as("SELECT * FROM review_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_item()).transpose()
    }

    async fn list_review_items(
        &self,
        workspace_id: &str,
        status: Option<ReviewStatus>,
    ) -> Result<Vec<ReviewItem>> {
        let rows: Vec<ReviewRow> = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT * FROM review_queue WHERE workspace_id = ? AND status = ? ORDER BY confidence DESC, created_at",
                )
                .bind(workspace_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM review_queue WHERE workspace_id = ? ORDER BY confidence DESC, created_at",
                )
                .bind(workspace_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(|r| r.into_item()).collect()
    }

    async fn decide_review(&self, id: &str, status: ReviewStatus) -> Result<bool> {
        if status == ReviewStatus::Open {
            return Err(Error::Validation("a review decision cannot be 'open'".to_string()));
        }

        let affected = sqlx::query(
            "UPDATE review_queue SET status = ?, decided_at = ? WHERE id = ? AND status = 'open'",
        )
        .bind(status.as_str())
        .bind(timestamp(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected > 0 {
            info!(review_id = %id, status = status.as_str(), "Review item decided");
        }
        Ok(affected > 0)
    }

    async fn stats(&self, workspace_id: &str) -> Result<RelationshipStats> {
        let by_source: Vec<(String, i64)> = sqlx::query_as(
            "SELECT source, COUNT(*) FROM relationships WHERE workspace_id = ? GROUP BY source",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = RelationshipStats::default();
        for (source, count) in by_source {
            let count = count.max(0) as u64;
            stats.relationships += count;
            match RelationshipSource::parse(&source) {
                Some(RelationshipSource::Deterministic) => stats.deterministic = count,
                Some(RelationshipSource::Semantic) => stats.semantic = count,
                Some(RelationshipSource::Manual) => stats.manual = count,
                None => {}
            }
        }

        let (pending,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM pending_relationships WHERE workspace_id = ?")
                .bind(workspace_id)
                .fetch_one(&self.pool)
                .await?;
        let (open_reviews,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM review_queue WHERE workspace_id = ? AND status = 'open'",
        )
        .bind(workspace_id)
        .fetch_one(&self.pool)
        .await?;

        stats.pending = pending.max(0) as u64;
        stats.open_reviews = open_reviews.max(0) as u64;
        Ok(stats)
    }
}

fn endpoint(kind: &str, id: String) -> Result<Endpoint> {
    let kind =
        NodeKind::parse(kind).ok_or_else(|| Error::Other(format!("Invalid node kind: {}", kind)))?;
    Ok(Endpoint { kind, id })
}

fn relationship_type(value: &str) -> Result<RelationshipType> {
    RelationshipType::parse(value)
        .ok_or_else(|| Error::Other(format!("Invalid relationship type: {}", value)))
}

fn relationship_source(value: &str) -> Result<RelationshipSource> {
    RelationshipSource::parse(value)
        .ok_or_else(|| Error::Other(format!("Invalid relationship source: {}", value)))
}

#[derive(Debug, FromRow)]
struct RelationshipRow {
    id: String,
    workspace_id: String,
    from_kind: String,
    from_id: String,
    to_kind: String,
    to_id: String,
    relationship_type: String,
    confidence: f32,
    source: String,
    created_at: String,
    updated_at: String,
}

impl RelationshipRow {
    fn into_relationship(self) -> Result<Relationship> {
        Ok(Relationship {
            from: endpoint(&self.from_kind, self.from_id)?,
            to: endpoint(&self.to_kind, self.to_id)?,
            relationship_type: relationship_type(&self.relationship_type)?,
            source: relationship_source(&self.source)?,
            id: self.id,
            workspace_id: self.workspace_id,
            confidence: self.confidence,
            status: RelationshipStatus::Resolved,
            evidence: Vec::new(),
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
        })
    }
}

#[derive(Debug, FromRow)]
struct EvidenceRow {
    quote: String,
    chunk_ref: Option<String>,
    reasoning: String,
    weight: f32,
    rule: Option<String>,
}

impl EvidenceRow {
    fn into_evidence(self) -> RelationshipEvidence {
        RelationshipEvidence {
            quote: self.quote,
            chunk_ref: self.chunk_ref,
            reasoning: self.reasoning,
            weight: self.weight,
            rule: self.rule,
        }
    }
}

#[derive(Debug, FromRow)]
struct PendingRow {
    id: String,
    workspace_id: String,
    from_document_id: String,
    target_source_type: String,
    target_source_id: String,
    relationship_type: String,
    confidence: f32,
    source: String,
    evidence: String,
    retry_count: i64,
    status: String,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl PendingRow {
    fn into_pending(self) -> Result<PendingRelationship> {
        let status = PendingStatus::parse(&self.status)
            .ok_or_else(|| Error::Other(format!("Invalid pending status: {}", self.status)))?;

        Ok(PendingRelationship {
            relationship_type: relationship_type(&self.relationship_type)?,
            source: relationship_source(&self.source)?,
            id: self.id,
            workspace_id: self.workspace_id,
            from_document_id: self.from_document_id,
            target: DocumentKey::new(self.target_source_type, self.target_source_id),
            confidence: self.confidence,
            evidence: from_json(&self.evidence),
            retry_count: self.retry_count.max(0) as u32,
            status,
            last_error: self.last_error,
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
        })
    }
}

#[derive(Debug, FromRow)]
struct ReviewRow {
    id: String,
    workspace_id: String,
    from_kind: String,
    from_id: String,
    to_kind: String,
    to_id: String,
    relationship_type: String,
    confidence: f32,
    source: String,
    evidence: String,
    status: String,
    created_at: String,
    decided_at: Option<String>,
}

impl ReviewRow {
    fn into_item(self) -> Result<ReviewItem> {
        let status = ReviewStatus::parse(&self.status)
            .ok_or_else(|| Error::Other(format!("Invalid review status: {}", self.status)))?;

        Ok(ReviewItem {
            from: endpoint(&self.from_kind, self.from_id)?,
            to: endpoint(&self.to_kind, self.to_id)?,
            relationship_type: relationship_type(&self.relationship_type)?,
            source: relationship_source(&self.source)?,
            id: self.id,
            workspace_id: self.workspace_id,
            confidence: self.confidence,
            evidence: from_json(&self.evidence),
            status,
            created_at: parse_timestamp(&self.created_at),
            decided_at: self.decided_at.as_deref().map(parse_timestamp),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::documents::{Document, DocumentRepository};
    use crate::infrastructure::sqlite::SqliteDocumentRepository;
    use crate::storage::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> (SqliteRelationshipRepository, SqliteDocumentRepository) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool");

        run_migrations(&pool)
            .await
            .expect("Failed to run migrations");

        (
            SqliteRelationshipRepository::new(pool.clone()),
            SqliteDocumentRepository::new(pool),
        )
    }

    fn edge(from: &str, to: &str, source: RelationshipSource, confidence: f32) -> Relationship {
        Relationship::new(
            "ws",
            Endpoint::document(from),
            Endpoint::document(to),
            RelationshipType::Resolves,
            source,
        )
        .with_confidence(confidence)
        .with_evidence(vec![RelationshipEvidence::from_rule(
            "closing_keyword",
            format!("Closes {}", to),
            confidence,
        )])
    }

    #[tokio::test]
    async fn test_write_pair_creates_forward_and_reverse() {
        let (repo, _) = setup_test_db().await;

        let write = repo
            .write_pair(&edge("pr-1", "issue-1", RelationshipSource::Deterministic, 0.95))
            .await
            .unwrap();
        assert_eq!(write.outcome, WriteOutcome::Created);
        let forward = write.forward.unwrap();
        let reverse = write.reverse.unwrap();
        assert!(forward.is_reverse_of(&reverse));
        assert_eq!(reverse.relationship_type, RelationshipType::ResolvedBy);

        let from_issue = repo
            .get_relationships("ws", "issue-1", Direction::Outgoing, &[])
            .await
            .unwrap();
        assert_eq!(from_issue.len(), 1);
        assert_eq!(from_issue[0].to.id, "pr-1");
        assert_eq!(from_issue[0].evidence.len(), 1);
        assert_eq!(repo.count_relationships("ws").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_write_pair_is_idempotent() {
        let (repo, _) = setup_test_db().await;
        let rel = edge("pr-1", "issue-1", RelationshipSource::Deterministic, 0.9);

        repo.write_pair(&rel).await.unwrap();
        let again = repo.write_pair(&rel).await.unwrap();
        assert_eq!(again.outcome, WriteOutcome::Unchanged);
        assert_eq!(repo.count_relationships("ws").await.unwrap(), 2);

        let stronger = edge("pr-1", "issue-1", RelationshipSource::Deterministic, 0.97);
        let updated = repo.write_pair(&stronger).await.unwrap();
        assert_eq!(updated.outcome, WriteOutcome::Updated);
        assert_eq!(updated.reverse.unwrap().confidence, 0.97);

        let weaker = edge("pr-1", "issue-1", RelationshipSource::Deterministic, 0.5);
        assert_eq!(repo.write_pair(&weaker).await.unwrap().outcome, WriteOutcome::Unchanged);

        // same quote, same fingerprint
        let rels = repo
            .get_relationships("ws", "pr-1", Direction::Outgoing, &[])
            .await
            .unwrap();
        assert_eq!(rels[0].evidence.len(), 1);
        assert_eq!(rels[0].confidence, 0.97);
    }

    #[tokio::test]
    async fn test_self_loop_rejected() {
        let (repo, _) = setup_test_db().await;
        let err = repo
            .write_pair(&edge("d1", "d1", RelationshipSource::Semantic, 0.9))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_deterministic_supersedes_semantic() {
        let (repo, _) = setup_test_db().await;

        repo.write_pair(&edge("a", "b", RelationshipSource::Semantic, 0.85))
            .await
            .unwrap();
        let write = repo
            .write_pair(&edge("a", "b", RelationshipSource::Deterministic, 0.95))
            .await
            .unwrap();
        assert_eq!(write.outcome, WriteOutcome::Created);
        assert_eq!(write.superseded.len(), 2);

        let stats = repo.stats("ws").await.unwrap();
        assert_eq!(stats.deterministic, 2);
        assert_eq!(stats.semantic, 0);

        // and blocks later semantic or manual writes of the same edge
        let blocked = repo
            .write_pair(&edge("a", "b", RelationshipSource::Semantic, 0.99))
            .await
            .unwrap();
        assert_eq!(blocked.outcome, WriteOutcome::Rejected);
        let blocked = repo
            .write_pair(&edge("a", "b", RelationshipSource::Manual, 0.99))
            .await
            .unwrap();
        assert_eq!(blocked.outcome, WriteOutcome::Rejected);
        assert_eq!(repo.count_relationships("ws").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_type_filter_and_direction() {
        let (repo, _) = setup_test_db().await;
        repo.write_pair(&edge("pr-1", "issue-1", RelationshipSource::Deterministic, 0.95))
            .await
            .unwrap();
        let mut authored = edge("pr-1", "person-1", RelationshipSource::Deterministic, 1.0);
        authored.relationship_type = RelationshipType::AuthoredBy;
        authored.to = Endpoint::entity("person-1");
        repo.write_pair(&authored).await.unwrap();

        let all = repo
            .get_relationships("ws", "pr-1", Direction::Both, &[])
            .await
            .unwrap();
        assert_eq!(all.len(), 4);

        let only = repo
            .get_relationships("ws", "pr-1", Direction::Outgoing, &[RelationshipType::AuthoredBy])
            .await
            .unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].to, Endpoint::entity("person-1"));

        assert!(
            repo.get_relationships("other", "pr-1", Direction::Both, &[])
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(repo.list_workspaces().await.unwrap(), vec!["ws".to_string()]);
    }

    #[tokio::test]
    async fn test_pending_save_and_promote_once() {
        let (repo, docs) = setup_test_db().await;
        let (source, _) = docs.register(&Document::new("ws", "github", "acme/api#1")).await.unwrap();
        let (target, _) = docs.register(&Document::new("ws", "linear", "LIN-1")).await.unwrap();

        let pending = PendingRelationship::new(
            "ws",
            &source.id,
            DocumentKey::new("linear", "LIN-1"),
            RelationshipType::Resolves,
            0.95,
            RelationshipSource::Deterministic,
            vec![RelationshipEvidence::from_rule("closing_keyword", "Fixes LIN-1", 0.95)],
        );
        let stored = repo.save_pending(&pending).await.unwrap();
        // duplicate proposal refreshes the same row
        let again = repo.save_pending(&PendingRelationship { id: "other".into(), ..pending.clone() }).await.unwrap();
        assert_eq!(stored.id, again.id);

        let waiting = repo
            .pending_for_target("ws", &DocumentKey::new("linear", "LIN-1"))
            .await
            .unwrap();
        assert_eq!(waiting.len(), 1);

        let endpoint = Endpoint::document(&target.id);
        let write = repo.promote_pending(&waiting[0], &endpoint).await.unwrap().unwrap();
        assert_eq!(write.outcome, WriteOutcome::Created);

        // second delivery finds the row gone
        assert!(repo.promote_pending(&waiting[0], &endpoint).await.unwrap().is_none());
        assert!(repo.list_pending("ws").await.unwrap().is_empty());
        assert_eq!(repo.count_relationships("ws").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pending_failure_bookkeeping() {
        let (repo, docs) = setup_test_db().await;
        let (source, _) = docs.register(&Document::new("ws", "github", "acme/api#1")).await.unwrap();
        let pending = repo
            .save_pending(&PendingRelationship::new(
                "ws",
                &source.id,
                DocumentKey::new("jira", "OPS-9"),
                RelationshipType::References,
                0.9,
                RelationshipSource::Deterministic,
                Vec::new(),
            ))
            .await
            .unwrap();

        repo.record_pending_failure(&pending.id, "database is locked").await.unwrap();
        let rows = repo.list_pending("ws").await.unwrap();
        assert_eq!(rows[0].retry_count, 1);
        assert_eq!(rows[0].status, PendingStatus::Retrying);
        assert_eq!(rows[0].last_error.as_deref(), Some("database is locked"));
    }

    #[tokio::test]
    async fn test_review_queue_lifecycle() {
        let (repo, _) = setup_test_db().await;
        let item = ReviewItem::new(
            "ws",
            Endpoint::document("support-1"),
            Endpoint::document("file-1"),
            RelationshipType::CausedBy,
            0.65,
            RelationshipSource::Semantic,
            vec![RelationshipEvidence::from_judgment("same stack", "NPE", 0.65)],
        );
        let stored = repo.enqueue_review(&item).await.unwrap().unwrap();

        // re-proposal refreshes the open item
        let refreshed = repo
            .enqueue_review(&ReviewItem { id: "new".into(), confidence: 0.7, ..item.clone() })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.id, stored.id);
        assert_eq!(refreshed.confidence, 0.7);

        assert!(repo.decide_review(&stored.id, ReviewStatus::Rejected).await.unwrap());
        assert!(!repo.decide_review(&stored.id, ReviewStatus::Approved).await.unwrap());

        // a decided item is not reopened
        let after = repo.enqueue_review(&item).await.unwrap().unwrap();
        assert_eq!(after.status, ReviewStatus::Rejected);
        assert!(
            repo.list_review_items("ws", Some(ReviewStatus::Open))
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(repo.stats("ws").await.unwrap().open_reviews, 0);
    }

    #[tokio::test]
    async fn test_review_blocked_by_deterministic_edge() {
        let (repo, _) = setup_test_db().await;
        repo.write_pair(&edge("pr-1", "issue-1", RelationshipSource::Deterministic, 0.95))
            .await
            .unwrap();

        let item = ReviewItem::new(
            "ws",
            Endpoint::document("pr-1"),
            Endpoint::document("issue-1"),
            RelationshipType::Resolves,
            0.7,
            RelationshipSource::Semantic,
            Vec::new(),
        );
        assert!(repo.enqueue_review(&item).await.unwrap().is_none());
        assert_eq!(repo.stats("ws").await.unwrap().open_reviews, 0);

        // a different type is still reviewable
        let other = ReviewItem {
            id: "other".into(),
            relationship_type: RelationshipType::RelatedTo,
            ..item
        };
        assert!(repo.enqueue_review(&other).await.unwrap().is_some());
    }
}
