//! SQLite implementation of the DocumentRepository

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::documents::{
    BackfillSelection, ChunkRef, Document, DocumentKey, DocumentRepository, ExtractionState,
    RegisterOutcome, SemanticStatus, StoredDocument,
};
use crate::error::{Error, Result};

use super::{from_json, parse_timestamp, timestamp, to_json};

#[derive(Clone)]
pub struct SqliteDocumentRepository {
    pool: SqlitePool,
}

impl SqliteDocumentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_by_key(&self, workspace_id: &str, key: &DocumentKey) -> Result<Option<DocumentRow>> {
        let row: Option<DocumentRow> = sqlx::query_as(
            "SELECT * FROM documents WHERE workspace_id = ? AND source_type = ? AND source_id = ?",
        )
        .bind(workspace_id)
        .bind(&key.source_type)
        .bind(&key.source_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_content(&self, id: &str, document: &Document, hash: &str) -> Result<()> {
        let fields = to_json(&document.structured_fields, "structured fields")?;
        let chunks = to_json(&document.chunk_refs, "chunk refs")?;

        sqlx::query(
            r#"
            UPDATE documents
            SET title = ?, body = ?, structured_fields = ?, chunk_refs = ?,
                content_hash = ?, ingested_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&document.title)
        .bind(&document.body)
        .bind(&fields)
        .bind(&chunks)
        .bind(hash)
        .bind(timestamp(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentRepository for SqliteDocumentRepository {
    async fn register(&self, document: &Document) -> Result<(StoredDocument, RegisterOutcome)> {
        let key = document.key();
        let hash = document.content_hash();

        let outcome = match self.fetch_by_key(&document.workspace_id, &key).await? {
            Some(row) if row.content_hash == hash => RegisterOutcome::Unchanged,
            Some(row) => {
                self.update_content(&row.id, document, &hash).await?;
                RegisterOutcome::Updated
            }
            None => {
                let fields = to_json(&document.structured_fields, "structured fields")?;
                let chunks = to_json(&document.chunk_refs, "chunk refs")?;
                let result = sqlx::query(
                    r#"
                    INSERT INTO documents (
                        id, workspace_id, source_type, source_id, title, body,
                        structured_fields, chunk_refs, content_hash, ingested_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(workspace_id, source_type, source_id) DO NOTHING
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&document.workspace_id)
                .bind(&key.source_type)
                .bind(&key.source_id)
                .bind(&document.title)
                .bind(&document.body)
                .bind(&fields)
                .bind(&chunks)
                .bind(&hash)
                .bind(timestamp(&Utc::now()))
                .execute(&self.pool)
                .await?;

                if result.rows_affected() == 1 {
                    RegisterOutcome::Created
                } else {
                    // A concurrent delivery registered the key first
                    let row = self
                        .fetch_by_key(&document.workspace_id, &key)
                        .await?
                        .ok_or_else(|| Error::Conflict(format!("document {}", key)))?;
                    if row.content_hash == hash {
                        RegisterOutcome::Unchanged
                    } else {
                        self.update_content(&row.id, document, &hash).await?;
                        RegisterOutcome::Updated
                    }
                }
            }
        };

        let stored = self
            .fetch_by_key(&document.workspace_id, &key)
            .await?
            .ok_or_else(|| Error::DocumentNotFound(key.to_string()))?
            .into_stored()?;

        match outcome {
            RegisterOutcome::Created => info!(document_id = %stored.id, key = %key, "Document registered"),
            RegisterOutcome::Updated => info!(document_id = %stored.id, key = %key, "Document updated"),
            RegisterOutcome::Unchanged => debug!(document_id = %stored.id, key = %key, "Duplicate delivery"),
        }
        Ok((stored, outcome))
    }

    async fn get_document(&self, id: &str) -> Result<Option<StoredDocument>> {
        let row: Option<DocumentRow> = sqlx::query_as("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_stored()).transpose()
    }

    async fn find_by_key(
        &self,
        workspace_id: &str,
        key: &DocumentKey,
    ) -> Result<Option<StoredDocument>> {
        self.fetch_by_key(workspace_id, key)
            .await?
            .map(|r| r.into_stored())
            .transpose()
    }

    async fn list_documents(&self, workspace_id: &str) -> Result<Vec<StoredDocument>> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            "SELECT * FROM documents WHERE workspace_id = ? ORDER BY ingested_at, id",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_stored()).collect()
    }

    async fn count_documents(&self, workspace_id: &str) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM documents WHERE workspace_id = ?")
            .bind(workspace_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn select_for_backfill(&self, selection: &BackfillSelection) -> Result<Vec<String>> {
        let since = selection.ingested_since.as_ref().map(timestamp);

        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT d.id, d.source_type
            FROM documents d
            LEFT JOIN extraction_state s ON s.document_id = d.id
            WHERE d.workspace_id = ?
              AND (? IS NULL OR d.ingested_at >= ?)
              AND (
                    ? = 1
                 OR s.document_id IS NULL
                 OR s.rule_version < ?
                 OR (? = 1 AND s.semantic_status = 'skipped')
              )
            ORDER BY d.ingested_at, d.id
            "#,
        )
        .bind(&selection.workspace_id)
        .bind(&since)
        .bind(&since)
        .bind(selection.include_processed)
        .bind(selection.current_rule_version as i64)
        .bind(selection.include_semantic_skipped)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|(_, source_type)| {
                selection.source_types.is_empty()
                    || selection
                        .source_types
                        .iter()
                        .any(|s| s.eq_ignore_ascii_case(source_type))
            })
            .map(|(id, _)| id)
            .collect())
    }

    async fn get_extraction_state(&self, document_id: &str) -> Result<Option<ExtractionState>> {
        let row: Option<ExtractionStateRow> =
            sqlx::query_as("SELECT * FROM extraction_state WHERE document_id = ?")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|r| r.into_state()).transpose()
    }

    async fn save_extraction_state(&self, state: &ExtractionState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO extraction_state (
                document_id, rule_version, semantic_status, attempts, last_error, processed_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                rule_version = excluded.rule_version,
                semantic_status = excluded.semantic_status,
                attempts = excluded.attempts,
                last_error = excluded.last_error,
                processed_at = excluded.processed_at
            "#,
        )
        .bind(&state.document_id)
        .bind(state.rule_version as i64)
        .bind(state.semantic_status.as_str())
        .bind(state.attempts as i64)
        .bind(&state.last_error)
        .bind(timestamp(&state.processed_at))
        .execute(&self.pool)
        .await?;

        debug!(
            document_id = %state.document_id,
            rule_version = state.rule_version,
            semantic_status = state.semantic_status.as_str(),
            "Extraction state saved"
        );
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct DocumentRow {
    id: String,
    workspace_id: String,
    source_type: String,
    source_id: String,
    title: String,
    body: String,
    structured_fields: String,
    chunk_refs: String,
    content_hash: String,
    ingested_at: String,
}

impl DocumentRow {
    fn into_stored(self) -> Result<StoredDocument> {
        let structured_fields: serde_json::Value = serde_json::from_str(&self.structured_fields)
            .map_err(|e| Error::Other(format!("Invalid structured fields for {}: {}", self.id, e)))?;
        let chunk_refs: Vec<ChunkRef> = from_json(&self.chunk_refs);

        Ok(StoredDocument {
            id: self.id,
            document: Document {
                workspace_id: self.workspace_id,
                source_type: self.source_type,
                source_id: self.source_id,
                title: self.title,
                body: self.body,
                structured_fields,
                chunk_refs,
            },
            content_hash: self.content_hash,
            ingested_at: parse_timestamp(&self.ingested_at),
        })
    }
}

#[derive(Debug, FromRow)]
struct ExtractionStateRow {
    document_id: String,
    rule_version: i64,
    semantic_status: String,
    attempts: i64,
    last_error: Option<String>,
    processed_at: String,
}

impl ExtractionStateRow {
    fn into_state(self) -> Result<ExtractionState> {
        let semantic_status = SemanticStatus::parse(&self.semantic_status).ok_or_else(|| {
            Error::Other(format!("Invalid semantic status: {}", self.semantic_status))
        })?;

        Ok(ExtractionState {
            document_id: self.document_id,
            rule_version: self.rule_version.max(0) as u32,
            semantic_status,
            attempts: self.attempts.max(0) as u32,
            last_error: self.last_error,
            processed_at: parse_timestamp(&self.processed_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::run_migrations;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqliteDocumentRepository {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool");

        run_migrations(&pool)
            .await
            .expect("Failed to run migrations");

        SqliteDocumentRepository::new(pool)
    }

    fn state(document_id: &str, rule_version: u32, status: SemanticStatus) -> ExtractionState {
        ExtractionState {
            document_id: document_id.to_string(),
            rule_version,
            semantic_status: status,
            attempts: 1,
            last_error: None,
            processed_at: Utc::now(),
        }
    }

    fn selection(include_processed: bool, include_semantic_skipped: bool) -> BackfillSelection {
        BackfillSelection {
            workspace_id: "ws".to_string(),
            source_types: Vec::new(),
            ingested_since: None,
            current_rule_version: 2,
            include_processed,
            include_semantic_skipped,
        }
    }

    #[tokio::test]
    async fn test_register_created_unchanged_updated() {
        let repo = setup_test_db().await;
        let doc = Document::new("ws", "Linear", "LIN-1")
            .with_title("Login broken")
            .with_fields(json!({"labels": ["bug"]}));

        let (first, outcome) = repo.register(&doc).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::Created);
        assert_eq!(first.document.source_type, "linear");

        let (again, outcome) = repo.register(&doc).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::Unchanged);
        assert_eq!(again.id, first.id);

        let edited = doc.clone().with_body("now with details");
        let (updated, outcome) = repo.register(&edited).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::Updated);
        assert_eq!(updated.id, first.id);
        assert_eq!(updated.document.body, "now with details");
        assert_eq!(updated.document.structured_fields, json!({"labels": ["bug"]}));

        assert_eq!(repo.count_documents("ws").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_find_by_key_is_workspace_scoped() {
        let repo = setup_test_db().await;
        repo.register(&Document::new("ws-a", "linear", "LIN-1")).await.unwrap();

        let key = DocumentKey::new("linear", "LIN-1");
        assert!(repo.find_by_key("ws-a", &key).await.unwrap().is_some());
        assert!(repo.find_by_key("ws-b", &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_extraction_state_upsert() {
        let repo = setup_test_db().await;
        let (doc, _) = repo.register(&Document::new("ws", "linear", "LIN-1")).await.unwrap();

        assert!(repo.get_extraction_state(&doc.id).await.unwrap().is_none());
        repo.save_extraction_state(&state(&doc.id, 1, SemanticStatus::Pending))
            .await
            .unwrap();
        repo.save_extraction_state(&state(&doc.id, 2, SemanticStatus::Skipped))
            .await
            .unwrap();

        let loaded = repo.get_extraction_state(&doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.rule_version, 2);
        assert_eq!(loaded.semantic_status, SemanticStatus::Skipped);
    }

    #[tokio::test]
    async fn test_select_for_backfill() {
        let repo = setup_test_db().await;
        let (never, _) = repo.register(&Document::new("ws", "linear", "LIN-1")).await.unwrap();
        let (stale, _) = repo.register(&Document::new("ws", "github", "a/b#1")).await.unwrap();
        let (current, _) = repo.register(&Document::new("ws", "github", "a/b#2")).await.unwrap();
        let (skipped, _) = repo.register(&Document::new("ws", "zendesk", "9")).await.unwrap();
        repo.register(&Document::new("other", "linear", "LIN-1")).await.unwrap();

        repo.save_extraction_state(&state(&stale.id, 1, SemanticStatus::Done)).await.unwrap();
        repo.save_extraction_state(&state(&current.id, 2, SemanticStatus::Done)).await.unwrap();
        repo.save_extraction_state(&state(&skipped.id, 2, SemanticStatus::Skipped))
            .await
            .unwrap();

        let mut stale_only = repo.select_for_backfill(&selection(false, false)).await.unwrap();
        stale_only.sort();
        let mut expected = vec![never.id.clone(), stale.id.clone()];
        expected.sort();
        assert_eq!(stale_only, expected);

        let with_skipped = repo.select_for_backfill(&selection(false, true)).await.unwrap();
        assert_eq!(with_skipped.len(), 3);
        assert!(with_skipped.contains(&skipped.id));

        let everything = repo.select_for_backfill(&selection(true, false)).await.unwrap();
        assert_eq!(everything.len(), 4);

        let mut github_only = selection(true, false);
        github_only.source_types = vec!["github".to_string()];
        let github = repo.select_for_backfill(&github_only).await.unwrap();
        assert_eq!(github.len(), 2);
        assert!(github.contains(&stale.id) && github.contains(&current.id));
    }

    #[tokio::test]
    async fn test_select_for_backfill_cutoff() {
        let repo = setup_test_db().await;
        repo.register(&Document::new("ws", "linear", "LIN-1")).await.unwrap();

        let mut future = selection(true, false);
        future.ingested_since = Some(Utc::now() + chrono::Duration::hours(1));
        assert!(repo.select_for_backfill(&future).await.unwrap().is_empty());

        let mut past = selection(true, false);
        past.ingested_since = Some(Utc::now() - chrono::Duration::hours(1));
        assert_eq!(repo.select_for_backfill(&past).await.unwrap().len(), 1);
    }
}
