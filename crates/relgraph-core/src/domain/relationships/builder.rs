//! Bidirectional builder
//!
//! Takes gated proposals to their terminal state: a resolved pair, a pending row, a
//! review item, or nothing. When a document arrives it promotes every pending row that
//! was waiting for it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::documents::{DocumentRepository, StoredDocument};
use crate::domain::graph::AdjacencyCache;
use crate::error::Result;

use super::gate::{ConfidenceGate, GateDecision};
use super::pending::PendingRelationship;
use super::proposal::{ProposalOutcome, RelationshipProposal, TargetRef};
use super::relationship::{Endpoint, Relationship};
use super::repository::{PairWrite, RelationshipRepository, WriteOutcome};
use super::review::ReviewItem;

/// Counts from a promotion sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionReport {
    pub promoted: usize,
    pub rejected: usize,
    pub failed: usize,
}

impl PromotionReport {
    fn merge(&mut self, other: PromotionReport) {
        self.promoted += other.promoted;
        self.rejected += other.rejected;
        self.failed += other.failed;
    }
}

/// Result of applying one proposal
#[derive(Debug, Clone)]
pub struct AppliedProposal {
    pub outcome: ProposalOutcome,
    /// Set when the proposal reached the store
    pub write: Option<PairWrite>,
}

impl AppliedProposal {
    fn outcome(outcome: ProposalOutcome) -> Self {
        Self {
            outcome,
            write: None,
        }
    }

    /// Whether a new pair was inserted
    pub fn created(&self) -> bool {
        self.write.as_ref().is_some_and(|w| w.is_created())
    }
}

pub struct BidirectionalBuilder {
    relationships: Arc<dyn RelationshipRepository>,
    documents: Arc<dyn DocumentRepository>,
    cache: Arc<AdjacencyCache>,
    gate: ConfidenceGate,
}

impl BidirectionalBuilder {
    pub fn new(
        relationships: Arc<dyn RelationshipRepository>,
        documents: Arc<dyn DocumentRepository>,
        cache: Arc<AdjacencyCache>,
        gate: ConfidenceGate,
    ) -> Self {
        Self {
            relationships,
            documents,
            cache,
            gate,
        }
    }

    pub fn gate(&self) -> &ConfidenceGate {
        &self.gate
    }

    /// Resolve a proposal target to an existing endpoint
    async fn resolve_target(&self, workspace_id: &str, target: &TargetRef) -> Result<Option<Endpoint>> {
        match target {
            TargetRef::Resolved(endpoint) => Ok(Some(endpoint.clone())),
            TargetRef::Document(key) => Ok(self
                .documents
                .find_by_key(workspace_id, key)
                .await?
                .map(|doc| Endpoint::document(doc.id))),
        }
    }

    /// Gate a proposal and carry it to its terminal state
    pub async fn apply(&self, proposal: RelationshipProposal) -> Result<AppliedProposal> {
        let decision = self.gate.classify(proposal.confidence);
        if decision == GateDecision::Discard {
            debug!(
                document_id = %proposal.from_document_id,
                target = %proposal.target,
                relationship_type = %proposal.relationship_type,
                confidence = proposal.confidence,
                "Proposal discarded below review threshold"
            );
            return Ok(AppliedProposal::outcome(ProposalOutcome::Discarded));
        }

        let from = Endpoint::document(&proposal.from_document_id);
        let target = self
            .resolve_target(&proposal.workspace_id, &proposal.target)
            .await?;

        if target.as_ref() == Some(&from) {
            debug!(document_id = %proposal.from_document_id, "Self-referencing proposal dropped");
            return Ok(AppliedProposal::outcome(ProposalOutcome::Discarded));
        }

        match (decision, target) {
            (GateDecision::Review, Some(to)) => {
                let item = ReviewItem::new(
                    &proposal.workspace_id,
                    from,
                    to,
                    proposal.relationship_type,
                    proposal.confidence,
                    proposal.source,
                    proposal.evidence,
                );
                let Some(stored) = self.relationships.enqueue_review(&item).await? else {
                    debug!(
                        document_id = %proposal.from_document_id,
                        relationship_type = %item.relationship_type,
                        "Review proposal rejected, deterministic edge exists"
                    );
                    return Ok(AppliedProposal::outcome(ProposalOutcome::Rejected));
                };
                info!(
                    review_id = %stored.id,
                    relationship_type = %stored.relationship_type,
                    confidence = stored.confidence,
                    "Proposal queued for review"
                );
                Ok(AppliedProposal::outcome(ProposalOutcome::QueuedForReview))
            }
            (GateDecision::Review, None) => {
                warn!(
                    document_id = %proposal.from_document_id,
                    target = %proposal.target,
                    "Review-band proposal has no resolvable target; discarded"
                );
                Ok(AppliedProposal::outcome(ProposalOutcome::Discarded))
            }
            (_, Some(to)) => {
                let relationship = Relationship::new(
                    &proposal.workspace_id,
                    from,
                    to,
                    proposal.relationship_type,
                    proposal.source,
                )
                .with_confidence(proposal.confidence)
                .with_evidence(proposal.evidence);

                let write = self.write(&relationship).await?;
                let outcome = if write.outcome == WriteOutcome::Rejected {
                    ProposalOutcome::Rejected
                } else {
                    ProposalOutcome::AcceptedResolved
                };
                Ok(AppliedProposal {
                    outcome,
                    write: Some(write),
                })
            }
            (_, None) => {
                let TargetRef::Document(key) = proposal.target else {
                    return Ok(AppliedProposal::outcome(ProposalOutcome::Discarded));
                };
                let pending = PendingRelationship::new(
                    &proposal.workspace_id,
                    &proposal.from_document_id,
                    key,
                    proposal.relationship_type,
                    proposal.confidence,
                    proposal.source,
                    proposal.evidence,
                );
                let stored = self.relationships.save_pending(&pending).await?;
                debug!(
                    pending_id = %stored.id,
                    target = %stored.target,
                    relationship_type = %stored.relationship_type,
                    "Proposal stored as pending"
                );

                // The target may have been registered and swept while this row was saved
                if let Some(document) = self
                    .documents
                    .find_by_key(&stored.workspace_id, &stored.target)
                    .await?
                {
                    let promotion = self
                        .promote_one(&stored, &Endpoint::document(&document.id))
                        .await;
                    if promotion.promoted > 0 {
                        return Ok(AppliedProposal::outcome(ProposalOutcome::AcceptedResolved));
                    }
                }
                Ok(AppliedProposal::outcome(ProposalOutcome::AcceptedPending))
            }
        }
    }

    /// Write a resolved pair and mirror it into the cache
    pub async fn write(&self, relationship: &Relationship) -> Result<PairWrite> {
        let write = self.relationships.write_pair(relationship).await?;
        if write.outcome != WriteOutcome::Rejected {
            self.cache.apply_write(&write).await;
        }
        Ok(write)
    }

    /// Promote every pending row waiting for a newly arrived document
    pub async fn promote_for_document(&self, document: &StoredDocument) -> Result<PromotionReport> {
        let pending = self
            .relationships
            .pending_for_target(document.workspace_id(), &document.key())
            .await?;

        let target = Endpoint::document(&document.id);
        let mut report = PromotionReport::default();
        for row in pending {
            report.merge(self.promote_one(&row, &target).await);
        }

        if report.promoted > 0 || report.failed > 0 {
            info!(
                document_id = %document.id,
                key = %document.key(),
                promoted = report.promoted,
                failed = report.failed,
                "Pending relationships promoted"
            );
        }
        Ok(report)
    }

    /// Promote every pending row of a workspace whose target already exists
    pub async fn promote_ready(&self, workspace_id: &str) -> Result<PromotionReport> {
        let mut report = PromotionReport::default();
        for row in self.relationships.list_pending(workspace_id).await? {
            let Some(document) = self.documents.find_by_key(workspace_id, &row.target).await?
            else {
                continue;
            };
            report.merge(
                self.promote_one(&row, &Endpoint::document(&document.id))
                    .await,
            );
        }
        Ok(report)
    }

    async fn promote_one(&self, row: &PendingRelationship, target: &Endpoint) -> PromotionReport {
        let mut report = PromotionReport::default();
        match self.relationships.promote_pending(row, target).await {
            Ok(Some(write)) if write.outcome == WriteOutcome::Rejected => {
                report.rejected += 1;
            }
            Ok(Some(write)) => {
                self.cache.apply_write(&write).await;
                report.promoted += 1;
            }
            // Consumed by a concurrent delivery
            Ok(None) => {}
            Err(e) => {
                warn!(pending_id = %row.id, error = %e, "Pending promotion failed");
                if let Err(record_err) = self
                    .relationships
                    .record_pending_failure(&row.id, &e.to_string())
                    .await
                {
                    warn!(pending_id = %row.id, error = %record_err, "Could not record promotion failure");
                }
                report.failed += 1;
            }
        }
        report
    }
}
