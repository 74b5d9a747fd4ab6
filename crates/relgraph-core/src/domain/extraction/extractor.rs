//! Deterministic reference extractor
//!
//! Turns one document into relationship proposals from its structured fields and from
//! pattern matches over its title and body. Person and other entity references are
//! resolved to canonical entity ids on the way out.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ExtractionConfig;
use crate::domain::documents::StoredDocument;
use crate::domain::identity::EntityResolver;
use crate::domain::relationships::{
    Endpoint, RelationshipEvidence, RelationshipProposal, RelationshipSource, TargetRef,
    dedup_proposals,
};
use crate::error::{Error, Result};

use super::fields::{FieldTarget, field_references, repository_name};
use super::patterns::{ScanContext, TextRules};

/// Proposals for one document
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutput {
    pub proposals: Vec<RelationshipProposal>,
    /// Entity references that could not be resolved
    pub unresolved_entities: usize,
    /// Entities created while resolving
    pub entities_created: usize,
}

impl ExtractionOutput {
    /// True when at least one proposal points at another document
    pub fn has_document_targets(&self) -> bool {
        self.proposals.iter().any(|p| p.target.is_document())
    }
}

/// Counts of what the extractor found, for logs and reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionCounts {
    pub field_refs: usize,
    pub text_refs: usize,
}

pub struct ReferenceExtractor {
    rules: TextRules,
    resolver: Arc<EntityResolver>,
}

impl ReferenceExtractor {
    pub fn new(config: &ExtractionConfig, resolver: Arc<EntityResolver>) -> Result<Self> {
        Ok(Self {
            rules: TextRules::new(config)?,
            resolver,
        })
    }

    pub fn rules(&self) -> &TextRules {
        &self.rules
    }

    /// Extract deterministic proposals from a stored document
    ///
    /// Output is de-duplicated by `(type, target)`; the highest confidence wins and
    /// evidence is merged.
    pub async fn extract(&self, stored: &StoredDocument) -> Result<ExtractionOutput> {
        let document = &stored.document;
        let workspace_id = document.workspace_id.as_str();
        let self_key = stored.key();
        let mut output = ExtractionOutput::default();
        let mut counts = ExtractionCounts::default();

        for reference in field_references(document) {
            let target = match reference.target {
                FieldTarget::Document(key) => {
                    if key == self_key {
                        continue;
                    }
                    TargetRef::Document(key)
                }
                FieldTarget::Entity(hint) => match self.resolver.resolve(workspace_id, &hint).await {
                    Ok(resolution) => {
                        if resolution.created {
                            output.entities_created += 1;
                        }
                        TargetRef::Resolved(Endpoint::entity(resolution.entity_id))
                    }
                    Err(Error::Validation(reason)) => {
                        debug!(field = reference.field, reason = %reason, "Skipping unusable identity");
                        output.unresolved_entities += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            counts.field_refs += 1;
            output.proposals.push(
                RelationshipProposal::new(
                    workspace_id,
                    &stored.id,
                    reference.relationship_type,
                    target,
                    RelationshipSource::Deterministic,
                )
                .with_confidence(1.0)
                .with_evidence(RelationshipEvidence::from_field(reference.field, reference.quote)),
            );
        }

        let ctx = ScanContext {
            repository: repository_name(document),
        };

        let title_matches = self.rules.scan(&document.title, &ctx);
        let body_matches = self.rules.scan(&document.body, &ctx);

        for (matched, in_body) in title_matches
            .into_iter()
            .map(|m| (m, false))
            .chain(body_matches.into_iter().map(|m| (m, true)))
        {
            if matched.target == self_key {
                continue;
            }
            let chunk_ref = if in_body {
                document.chunk_at(matched.start).map(|c| c.id.clone())
            } else {
                None
            };

            counts.text_refs += 1;
            output.proposals.push(
                RelationshipProposal::new(
                    workspace_id,
                    &stored.id,
                    matched.relationship_type,
                    TargetRef::Document(matched.target),
                    RelationshipSource::Deterministic,
                )
                .with_confidence(matched.confidence)
                .with_evidence(
                    RelationshipEvidence::from_rule(matched.rule, matched.quote, matched.confidence)
                        .with_chunk(chunk_ref),
                ),
            );
        }

        output.proposals = dedup_proposals(output.proposals);

        if output.unresolved_entities > 0 {
            warn!(
                document_id = %stored.id,
                unresolved = output.unresolved_entities,
                "Some entity references could not be resolved"
            );
        }
        debug!(
            document_id = %stored.id,
            field_refs = counts.field_refs,
            text_refs = counts.text_refs,
            proposals = output.proposals.len(),
            "Extraction complete"
        );

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use crate::domain::documents::{ChunkRef, Document, DocumentKey};
    use crate::domain::relationships::{NodeKind, RelationshipType};
    use crate::infrastructure::sqlite::SqliteIdentityRepository;
    use crate::storage::run_migrations;
    use chrono::Utc;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_extractor() -> ReferenceExtractor {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();

        let repo = Arc::new(SqliteIdentityRepository::new(pool));
        let resolver = Arc::new(EntityResolver::new(repo, IdentityConfig::default()));
        ReferenceExtractor::new(&ExtractionConfig::default(), resolver).unwrap()
    }

    fn stored(document: Document) -> StoredDocument {
        StoredDocument {
            id: "doc-1".to_string(),
            content_hash: document.content_hash(),
            document,
            ingested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_pull_request_fields_and_text() {
        let extractor = setup_extractor().await;
        let doc = Document::new("ws", "github", "acme/api#456")
            .with_title("Fix login timeout")
            .with_body("This change Closes LIN-123 and mentions LIN-123 again.")
            .with_fields(json!({"author": "octocat"}));

        let output = extractor.extract(&stored(doc)).await.unwrap();

        assert_eq!(output.proposals.len(), 2);
        assert_eq!(output.entities_created, 1);

        let author = &output.proposals[0];
        assert_eq!(author.relationship_type, RelationshipType::AuthoredBy);
        assert_eq!(author.confidence, 1.0);
        let TargetRef::Resolved(endpoint) = &author.target else {
            panic!("author should resolve to an entity");
        };
        assert_eq!(endpoint.kind, NodeKind::Entity);

        let resolves = &output.proposals[1];
        assert_eq!(resolves.relationship_type, RelationshipType::Resolves);
        assert_eq!(resolves.target, TargetRef::Document(DocumentKey::new("linear", "LIN-123")));
        assert_eq!(resolves.confidence, 0.95);
        assert!(output.has_document_targets());
    }

    #[tokio::test]
    async fn test_same_person_resolves_once() {
        let extractor = setup_extractor().await;
        let doc = Document::new("ws", "github", "acme/api#1").with_fields(json!({
            "author": "octocat",
            "reviewers": ["octocat"]
        }));

        let output = extractor.extract(&stored(doc)).await.unwrap();
        assert_eq!(output.proposals.len(), 2);
        assert_eq!(output.proposals[0].target, output.proposals[1].target);
    }

    #[tokio::test]
    async fn test_self_reference_dropped() {
        let extractor = setup_extractor().await;
        let doc = Document::new("ws", "linear", "LIN-5").with_body("Duplicate of LIN-5, see LIN-6");

        let output = extractor.extract(&stored(doc)).await.unwrap();
        assert_eq!(output.proposals.len(), 1);
        assert_eq!(
            output.proposals[0].target,
            TargetRef::Document(DocumentKey::new("linear", "LIN-6"))
        );
    }

    #[tokio::test]
    async fn test_body_match_carries_chunk() {
        let extractor = setup_extractor().await;
        let body = "intro text. resolves LIN-9";
        let doc = Document::new("ws", "slack", "C1/171")
            .with_body(body)
            .with_chunks(vec![
                ChunkRef {
                    id: "c0".into(),
                    start: 0,
                    end: 12,
                },
                ChunkRef {
                    id: "c1".into(),
                    start: 12,
                    end: body.len(),
                },
            ]);

        let output = extractor.extract(&stored(doc)).await.unwrap();
        assert_eq!(output.proposals.len(), 1);
        assert_eq!(output.proposals[0].evidence[0].chunk_ref.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_plain_text_has_no_proposals() {
        let extractor = setup_extractor().await;
        let doc = Document::new("ws", "notion", "page-1").with_body("Nothing to see here.");

        let output = extractor.extract(&stored(doc)).await.unwrap();
        assert!(output.proposals.is_empty());
        assert!(!output.has_document_targets());
    }
}
