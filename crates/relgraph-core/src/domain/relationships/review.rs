//! Review queue for proposals in the middle confidence band

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::relationship::{
    Endpoint, Relationship, RelationshipEvidence, RelationshipSource, RelationshipType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Open,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A proposed edge that needs a human decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: String,
    pub workspace_id: String,
    pub from: Endpoint,
    pub to: Endpoint,
    pub relationship_type: RelationshipType,
    pub confidence: f32,
    /// Source the proposal came from (semantic in practice)
    pub source: RelationshipSource,
    pub evidence: Vec<RelationshipEvidence>,
    pub status: ReviewStatus,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl ReviewItem {
    pub fn new(
        workspace_id: impl Into<String>,
        from: Endpoint,
        to: Endpoint,
        relationship_type: RelationshipType,
        confidence: f32,
        source: RelationshipSource,
        evidence: Vec<RelationshipEvidence>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            from,
            to,
            relationship_type,
            confidence,
            source,
            evidence,
            status: ReviewStatus::Open,
            created_at: Utc::now(),
            decided_at: None,
        }
    }

    /// The manual relationship written when this item is approved
    pub fn to_manual_relationship(&self, reason: &str) -> Relationship {
        let mut evidence = self.evidence.clone();
        evidence.push(RelationshipEvidence {
            quote: String::new(),
            chunk_ref: None,
            reasoning: format!("approved in review: {}", reason),
            weight: 1.0,
            rule: Some("review".to_string()),
        });

        Relationship::new(
            &self.workspace_id,
            self.from.clone(),
            self.to.clone(),
            self.relationship_type,
            RelationshipSource::Manual,
        )
        .with_confidence(self.confidence)
        .with_evidence(evidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_relationship_from_review() {
        let item = ReviewItem::new(
            "ws",
            Endpoint::document("support-1"),
            Endpoint::document("file-1"),
            RelationshipType::CausedBy,
            0.65,
            RelationshipSource::Semantic,
            vec![RelationshipEvidence::from_judgment("stack trace matches", "NullPointer", 0.65)],
        );

        let rel = item.to_manual_relationship("confirmed by on-call");
        assert_eq!(rel.source, RelationshipSource::Manual);
        assert_eq!(rel.confidence, 0.65);
        assert_eq!(rel.evidence.len(), 2);
        assert_eq!(rel.from, item.from);
        assert_eq!(item.status, ReviewStatus::Open);
    }

    #[test]
    fn test_review_status_parse() {
        assert_eq!(ReviewStatus::parse("approved"), Some(ReviewStatus::Approved));
        assert_eq!(ReviewStatus::parse("maybe"), None);
    }
}
