//! Ingested documents
//!
//! Documents are produced by the ingestion collaborator and are immutable once
//! stored. The core keeps a registry row per `(workspace, source_type, source_id)` so
//! that relationship targets can be resolved and backfill can select documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Natural key of a document inside a workspace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    /// Source system (e.g. `github`, `linear`, `sentry`)
    pub source_type: String,
    /// Identifier inside the source system (e.g. `LIN-123`, `acme/api#456`)
    pub source_id: String,
}

impl DocumentKey {
    /// Build a key, folding case where the source system ignores it
    pub fn new(source_type: impl Into<String>, source_id: impl Into<String>) -> Self {
        let source_type = source_type.into().trim().to_lowercase();
        let source_id = normalize_source_id(&source_type, source_id.into().trim());
        Self {
            source_type,
            source_id,
        }
    }
}

fn normalize_source_id(source_type: &str, source_id: &str) -> String {
    match source_type {
        // `owner/repo` is case-insensitive; a file path after ':' is not
        "github" => match source_id.find(['#', ':']) {
            Some(at) => format!("{}{}", source_id[..at].to_lowercase(), &source_id[at..]),
            None => source_id.to_lowercase(),
        },
        "linear" | "jira" => source_id.to_uppercase(),
        _ => source_id.to_string(),
    }
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.source_type, self.source_id)
    }
}

/// A span of the document body that was embedded as one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub id: String,
    /// Byte offset where the chunk starts in `body`
    pub start: usize,
    /// Byte offset one past the end of the chunk
    pub end: usize,
}

/// A document as delivered by the `document.ingested` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub workspace_id: String,
    pub source_type: String,
    pub source_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    /// Source-specific structured fields (author, assignees, linked items, ...)
    #[serde(default)]
    pub structured_fields: serde_json::Value,
    #[serde(default)]
    pub chunk_refs: Vec<ChunkRef>,
}

impl Document {
    pub fn new(
        workspace_id: impl Into<String>,
        source_type: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            source_type: source_type.into(),
            source_id: source_id.into(),
            title: String::new(),
            body: String::new(),
            structured_fields: serde_json::Value::Null,
            chunk_refs: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_fields(mut self, fields: serde_json::Value) -> Self {
        self.structured_fields = fields;
        self
    }

    pub fn with_chunks(mut self, chunks: Vec<ChunkRef>) -> Self {
        self.chunk_refs = chunks;
        self
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(&self.source_type, &self.source_id)
    }

    /// Reject documents the pipeline cannot process
    pub fn validate(&self) -> Result<()> {
        if self.workspace_id.trim().is_empty() {
            return Err(Error::Validation("document has no workspace_id".into()));
        }
        if self.source_type.trim().is_empty() || self.source_id.trim().is_empty() {
            return Err(Error::Validation(format!(
                "document in workspace {} is missing source_type or source_id",
                self.workspace_id
            )));
        }
        if !(self.structured_fields.is_object() || self.structured_fields.is_null()) {
            return Err(Error::Validation(format!(
                "structured_fields of {} must be an object",
                self.key()
            )));
        }
        for chunk in &self.chunk_refs {
            if chunk.start > chunk.end || chunk.end > self.body.len() {
                return Err(Error::Validation(format!(
                    "chunk {} of {} is out of bounds",
                    chunk.id,
                    self.key()
                )));
            }
        }
        Ok(())
    }

    /// SHA-256 over the content; a new version of a document gets a new hash
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.title.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.body.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.structured_fields.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Chunk containing a byte offset of the body
    pub fn chunk_at(&self, offset: usize) -> Option<&ChunkRef> {
        self.chunk_refs
            .iter()
            .find(|c| c.start <= offset && offset < c.end)
    }

    /// Title and body, the text searched by the pattern rules
    pub fn text(&self) -> String {
        if self.title.is_empty() {
            self.body.clone()
        } else {
            format!("{}\n{}", self.title, self.body)
        }
    }
}

/// A document registered in the core
#[derive(Debug, Clone)]
pub struct StoredDocument {
    /// Internal id, used as a relationship endpoint
    pub id: String,
    pub document: Document,
    pub content_hash: String,
    pub ingested_at: DateTime<Utc>,
}

impl StoredDocument {
    pub fn key(&self) -> DocumentKey {
        self.document.key()
    }

    pub fn workspace_id(&self) -> &str {
        &self.document.workspace_id
    }
}

/// Status of the semantic stage for a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticStatus {
    /// Not yet attempted
    Pending,
    /// Oracle judged the candidates
    Done,
    /// Dependency failures exhausted retries; eligible for backfill
    Skipped,
    /// Structural references were found, so the stage did not run
    NotApplicable,
}

impl SemanticStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Skipped => "skipped",
            Self::NotApplicable => "not_applicable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "done" => Some(Self::Done),
            "skipped" => Some(Self::Skipped),
            "not_applicable" => Some(Self::NotApplicable),
            _ => None,
        }
    }
}

/// Record of the last extraction pass over a document
#[derive(Debug, Clone)]
pub struct ExtractionState {
    pub document_id: String,
    pub rule_version: u32,
    pub semantic_status: SemanticStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub processed_at: DateTime<Utc>,
}
