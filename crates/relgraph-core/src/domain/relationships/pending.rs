//! Pending relationships awaiting their target document

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::documents::DocumentKey;

use super::relationship::{RelationshipEvidence, RelationshipSource, RelationshipType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    /// Target has not been ingested
    Waiting,
    /// A promotion attempt failed and will be retried
    Retrying,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "retrying" => Some(Self::Retrying),
            _ => None,
        }
    }
}

/// An accepted proposal whose target document does not exist yet
#[derive(Debug, Clone)]
pub struct PendingRelationship {
    pub id: String,
    pub workspace_id: String,
    pub from_document_id: String,
    pub target: DocumentKey,
    pub relationship_type: RelationshipType,
    pub confidence: f32,
    pub source: RelationshipSource,
    pub evidence: Vec<RelationshipEvidence>,
    pub retry_count: u32,
    pub status: PendingStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingRelationship {
    pub fn new(
        workspace_id: impl Into<String>,
        from_document_id: impl Into<String>,
        target: DocumentKey,
        relationship_type: RelationshipType,
        confidence: f32,
        source: RelationshipSource,
        evidence: Vec<RelationshipEvidence>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            from_document_id: from_document_id.into(),
            target,
            relationship_type,
            confidence,
            source,
            evidence,
            retry_count: 0,
            status: PendingStatus::Waiting,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
