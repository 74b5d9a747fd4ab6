//! Semantic candidate engine
//!
//! Retrieves nearby documents from the vector index, asks the judgment oracle about
//! them, and turns validated judgments into semantic proposals. Gating happens later in
//! the builder; this stage only proposes.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{OracleConfig, SemanticConfig};
use crate::domain::documents::{DocumentRepository, StoredDocument};
use crate::domain::relationships::{
    Endpoint, RelationshipEvidence, RelationshipProposal, RelationshipSource, TargetRef,
    dedup_proposals,
};
use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, retry_with_backoff};

use super::oracle::{
    JudgmentCandidate, JudgmentDocument, JudgmentOracle, JudgmentRequest, parse_judgments,
};
use super::vector::VectorIndex;

/// Oracle text is cut to this many characters per document
const MAX_DOCUMENT_CHARS: usize = 4_000;

/// What the semantic stage produced for one document
#[derive(Debug, Clone, Default)]
pub struct SemanticOutcome {
    pub proposals: Vec<RelationshipProposal>,
    /// Candidates sent to the oracle
    pub candidates: usize,
    /// Valid judgments received
    pub judged: usize,
    /// Judgments answered NONE
    pub none_judgments: usize,
    /// Reply items (or whole replies) that failed validation
    pub schema_violations: usize,
}

pub struct SemanticCandidateEngine {
    index: Arc<dyn VectorIndex>,
    oracle: Arc<dyn JudgmentOracle>,
    documents: Arc<dyn DocumentRepository>,
    config: SemanticConfig,
    oracle_timeout: Duration,
    retry: RetryPolicy,
}

impl SemanticCandidateEngine {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        oracle: Arc<dyn JudgmentOracle>,
        documents: Arc<dyn DocumentRepository>,
        config: SemanticConfig,
        oracle_config: &OracleConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            index,
            oracle,
            documents,
            config,
            oracle_timeout: Duration::from_secs(oracle_config.timeout_secs.max(1)),
            retry,
        }
    }

    pub fn config(&self) -> &SemanticConfig {
        &self.config
    }

    /// Propose semantic relationships for a document
    ///
    /// Vector and oracle failures that survive retry are returned as errors so the
    /// caller can mark the document for a later pass. Malformed oracle output is not an
    /// error.
    pub async fn propose(&self, stored: &StoredDocument) -> Result<SemanticOutcome> {
        let workspace_id = stored.workspace_id();
        let self_key = stored.key();
        let mut outcome = SemanticOutcome::default();

        let vector_timeout = Duration::from_millis(self.config.vector_timeout_ms.max(1));
        let k = self.config.top_k;
        let hits = retry_with_backoff(&self.retry, "vector_index", vector_timeout, || {
            self.index.nearest(workspace_id, stored, k + 1)
        })
        .await?;

        let mut candidates = Vec::new();
        for hit in hits {
            if candidates.len() >= k {
                break;
            }
            if hit.key == self_key || hit.similarity < self.config.min_similarity {
                continue;
            }
            // Keys resolve only inside the source workspace
            let Some(candidate) = self.documents.find_by_key(workspace_id, &hit.key).await? else {
                debug!(key = %hit.key, "Vector hit has no registered document");
                continue;
            };
            if candidate.id == stored.id {
                continue;
            }
            candidates.push(JudgmentCandidate {
                document: judgment_document(&candidate),
                similarity: hit.similarity,
            });
        }

        outcome.candidates = candidates.len();
        if candidates.is_empty() {
            debug!(document_id = %stored.id, "No semantic candidates above threshold");
            return Ok(outcome);
        }

        let request = JudgmentRequest {
            workspace_id: workspace_id.to_string(),
            source: judgment_document(stored),
            candidates,
        };

        let reply = retry_with_backoff(&self.retry, "oracle", self.oracle_timeout, || {
            self.oracle.judge(&request)
        })
        .await
        .and_then(|raw| parse_judgments(&raw, &request));

        let parsed = match reply {
            Ok(parsed) => parsed,
            Err(Error::SchemaViolation(reason)) => {
                warn!(document_id = %stored.id, reason = %reason, "Discarding malformed oracle reply");
                outcome.schema_violations = 1;
                return Ok(outcome);
            }
            Err(e) => return Err(e),
        };

        for violation in &parsed.violations {
            warn!(document_id = %stored.id, violation = %violation, "Discarding invalid judgment");
        }
        outcome.schema_violations = parsed.violations.len();
        outcome.judged = parsed.judgments.len();

        for judgment in parsed.judgments {
            let Some(relationship_type) = judgment.relationship_type else {
                outcome.none_judgments += 1;
                continue;
            };

            let mut proposal = RelationshipProposal::new(
                workspace_id,
                &stored.id,
                relationship_type,
                TargetRef::Resolved(Endpoint::document(&judgment.candidate_id)),
                RelationshipSource::Semantic,
            )
            .with_confidence(judgment.confidence)
            .with_evidence(RelationshipEvidence::from_judgment(
                &judgment.reasoning,
                &judgment.source_evidence,
                judgment.confidence,
            ));
            if !judgment.target_evidence.is_empty() {
                proposal = proposal.with_evidence(RelationshipEvidence::from_judgment(
                    format!("target: {}", judgment.reasoning),
                    &judgment.target_evidence,
                    judgment.confidence,
                ));
            }
            outcome.proposals.push(proposal);
        }

        outcome.proposals = dedup_proposals(outcome.proposals);

        info!(
            document_id = %stored.id,
            candidates = outcome.candidates,
            proposals = outcome.proposals.len(),
            violations = outcome.schema_violations,
            "Semantic judgments received"
        );

        Ok(outcome)
    }
}

fn judgment_document(stored: &StoredDocument) -> JudgmentDocument {
    JudgmentDocument {
        id: stored.id.clone(),
        key: stored.key(),
        title: stored.document.title.clone(),
        text: stored.document.body.chars().take(MAX_DOCUMENT_CHARS).collect(),
    }
}
