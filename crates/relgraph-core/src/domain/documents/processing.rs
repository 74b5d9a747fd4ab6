//! Per-document processing report

use serde::{Deserialize, Serialize};

use super::document::SemanticStatus;
use super::repository::RegisterOutcome;

/// What one pass over a document did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingReport {
    pub document_id: String,
    /// `None` when the document was reprocessed without being re-registered
    pub registered: Option<RegisterOutcome>,
    /// Deterministic proposals after de-duplication
    pub deterministic_proposals: usize,
    /// Semantic proposals after de-duplication
    pub semantic_proposals: usize,
    /// New resolved pairs written
    pub created: usize,
    /// Existing pairs whose confidence was raised
    pub updated: usize,
    pub pending: usize,
    pub queued_for_review: usize,
    pub discarded: usize,
    /// Blocked by an existing deterministic edge
    pub rejected: usize,
    /// Pending rows promoted because this document arrived
    pub promoted: usize,
    pub semantic_status: SemanticStatus,
    pub schema_violations: usize,
}

impl ProcessingReport {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            registered: None,
            deterministic_proposals: 0,
            semantic_proposals: 0,
            created: 0,
            updated: 0,
            pending: 0,
            queued_for_review: 0,
            discarded: 0,
            rejected: 0,
            promoted: 0,
            semantic_status: SemanticStatus::Pending,
            schema_violations: 0,
        }
    }
}
