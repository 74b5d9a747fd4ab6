//! Merge suggestions and the results of admin merge/split operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Open,
    /// Another open suggestion points the same entity elsewhere
    Conflicted,
    Applied,
    Dismissed,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Conflicted => "conflicted",
            Self::Applied => "applied",
            Self::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "conflicted" => Some(Self::Conflicted),
            "applied" => Some(Self::Applied),
            "dismissed" => Some(Self::Dismissed),
            _ => None,
        }
    }
}

/// A heuristic identity match that was not confident enough to apply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSuggestion {
    pub id: String,
    pub workspace_id: String,
    /// Entity that would be merged away
    pub entity_id: String,
    /// Entity it would be merged into
    pub candidate_entity_id: String,
    pub confidence: f32,
    /// Signals that matched (e.g. `email_domain`, `handle`)
    pub signals: Vec<String>,
    pub status: SuggestionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MergeSuggestion {
    pub fn new(
        workspace_id: impl Into<String>,
        entity_id: impl Into<String>,
        candidate_entity_id: impl Into<String>,
        confidence: f32,
        signals: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            entity_id: entity_id.into(),
            candidate_entity_id: candidate_entity_id.into(),
            confidence,
            signals,
            status: SuggestionStatus::Open,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of merging one entity into another
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    pub from_entity_id: String,
    pub into_entity_id: String,
    pub aliases_moved: usize,
    pub relationships_rewritten: usize,
    /// Edges dropped because the rewritten edge already existed
    pub relationships_dropped: usize,
    pub audit_id: String,
}

/// Outcome of splitting aliases off an entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitResult {
    pub original_entity_id: String,
    pub new_entity: Entity,
    pub aliases_moved: usize,
    pub audit_id: String,
}
