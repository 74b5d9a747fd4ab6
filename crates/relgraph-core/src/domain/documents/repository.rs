//! Repository trait for the document registry

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::document::{Document, DocumentKey, ExtractionState, StoredDocument};

/// What registering a document did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterOutcome {
    /// First time this key was seen
    Created,
    /// Known key, new content hash
    Updated,
    /// Duplicate delivery of the same content
    Unchanged,
}

/// Which documents a backfill run should revisit
#[derive(Debug, Clone)]
pub struct BackfillSelection {
    pub workspace_id: String,
    /// Empty means every source type
    pub source_types: Vec<String>,
    /// Only documents ingested at or after this instant
    pub ingested_since: Option<DateTime<Utc>>,
    /// Documents processed under an older rule version are stale
    pub current_rule_version: u32,
    /// Select every matching document regardless of extraction state
    pub include_processed: bool,
    /// Also select documents whose semantic stage was skipped
    pub include_semantic_skipped: bool,
}

/// Repository trait for document persistence
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Register a document under its `(workspace, source_type, source_id)` key
    ///
    /// The internal id is stable across new versions of the same document.
    async fn register(&self, document: &Document) -> Result<(StoredDocument, RegisterOutcome)>;

    /// Get a document by internal id
    async fn get_document(&self, id: &str) -> Result<Option<StoredDocument>>;

    /// Look a document up by natural key
    async fn find_by_key(
        &self,
        workspace_id: &str,
        key: &DocumentKey,
    ) -> Result<Option<StoredDocument>>;

    /// List documents of a workspace, oldest first
    async fn list_documents(&self, workspace_id: &str) -> Result<Vec<StoredDocument>>;

    /// Count documents of a workspace
    async fn count_documents(&self, workspace_id: &str) -> Result<u64>;

    /// Ids of documents matching a backfill selection, oldest first
    async fn select_for_backfill(&self, selection: &BackfillSelection) -> Result<Vec<String>>;

    async fn get_extraction_state(&self, document_id: &str) -> Result<Option<ExtractionState>>;

    async fn save_extraction_state(&self, state: &ExtractionState) -> Result<()>;
}
