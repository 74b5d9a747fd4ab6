//! Relationship proposals produced by the extractor and the semantic engine

use serde::{Deserialize, Serialize};

use crate::domain::documents::DocumentKey;

use super::relationship::{Endpoint, RelationshipEvidence, RelationshipSource, RelationshipType};

/// What a proposal points at
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum TargetRef {
    /// A document by natural key; it may not have been ingested yet
    Document(DocumentKey),
    /// An endpoint that is already known to exist
    Resolved(Endpoint),
}

impl TargetRef {
    pub fn is_document(&self) -> bool {
        match self {
            Self::Document(_) => true,
            Self::Resolved(endpoint) => endpoint.kind == super::NodeKind::Document,
        }
    }
}

impl std::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Document(key) => write!(f, "{}", key),
            Self::Resolved(endpoint) => write!(f, "{}", endpoint),
        }
    }
}

/// A candidate relationship from a document to a target
#[derive(Debug, Clone)]
pub struct RelationshipProposal {
    pub workspace_id: String,
    /// Internal id of the source document
    pub from_document_id: String,
    pub relationship_type: RelationshipType,
    pub target: TargetRef,
    pub confidence: f32,
    pub source: RelationshipSource,
    pub evidence: Vec<RelationshipEvidence>,
}

impl RelationshipProposal {
    pub fn new(
        workspace_id: impl Into<String>,
        from_document_id: impl Into<String>,
        relationship_type: RelationshipType,
        target: TargetRef,
        source: RelationshipSource,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            from_document_id: from_document_id.into(),
            relationship_type,
            target,
            confidence: 1.0,
            source,
            evidence: Vec::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_evidence(mut self, evidence: RelationshipEvidence) -> Self {
        self.evidence.push(evidence);
        self
    }

    /// Key used to de-duplicate proposals of one document
    pub fn dedup_key(&self) -> (RelationshipType, TargetRef) {
        (self.relationship_type, self.target.clone())
    }
}

/// Where a proposal ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalOutcome {
    /// Resolved pair written (or already present)
    AcceptedResolved,
    /// Target missing; stored as a pending row
    AcceptedPending,
    /// Confidence in the review band
    QueuedForReview,
    /// Confidence below the review band
    Discarded,
    /// Blocked at the write path by an existing deterministic edge
    Rejected,
}

/// Deduplicate proposals by `(type, target)`, keeping the most confident one
///
/// Evidence of dropped duplicates is folded into the survivor. Output order follows the
/// first appearance of each key.
pub fn dedup_proposals(proposals: Vec<RelationshipProposal>) -> Vec<RelationshipProposal> {
    let mut order: Vec<(RelationshipType, TargetRef)> = Vec::new();
    let mut best: std::collections::HashMap<(RelationshipType, TargetRef), RelationshipProposal> =
        std::collections::HashMap::new();

    for proposal in proposals {
        let key = proposal.dedup_key();
        match best.get_mut(&key) {
            Some(existing) => {
                let mut evidence = std::mem::take(&mut existing.evidence);
                if proposal.confidence > existing.confidence {
                    *existing = proposal;
                    evidence.append(&mut existing.evidence);
                    existing.evidence = evidence;
                } else {
                    evidence.extend(proposal.evidence);
                    existing.evidence = evidence;
                }
            }
            None => {
                order.push(key.clone());
                best.insert(key, proposal);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| best.remove(&key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(target: &str, confidence: f32, quote: &str) -> RelationshipProposal {
        RelationshipProposal::new(
            "ws",
            "doc-1",
            RelationshipType::References,
            TargetRef::Document(DocumentKey::new("linear", target)),
            RelationshipSource::Deterministic,
        )
        .with_confidence(confidence)
        .with_evidence(RelationshipEvidence::from_rule("bare_issue_key", quote, confidence))
    }

    #[test]
    fn test_dedup_keeps_highest_confidence() {
        let deduped = dedup_proposals(vec![
            proposal("LIN-1", 0.90, "LIN-1"),
            proposal("LIN-2", 0.90, "LIN-2"),
            proposal("LIN-1", 0.97, "https://linear.app/acme/issue/LIN-1"),
        ]);

        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].confidence, 0.97);
        assert_eq!(deduped[0].evidence.len(), 2);
        assert_eq!(deduped[1].target.to_string(), "linear/LIN-2");
    }

    #[test]
    fn test_dedup_distinguishes_types() {
        let mut resolves = proposal("LIN-1", 0.95, "Closes LIN-1");
        resolves.relationship_type = RelationshipType::Resolves;
        let deduped = dedup_proposals(vec![resolves, proposal("LIN-1", 0.90, "LIN-1")]);
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn test_target_is_document() {
        assert!(TargetRef::Document(DocumentKey::new("github", "1")).is_document());
        assert!(TargetRef::Resolved(Endpoint::document("d")).is_document());
        assert!(!TargetRef::Resolved(Endpoint::entity("e")).is_document());
    }
}
