//! Relationship pipeline
//!
//! The public entry point of the core. Wires the registry, resolver, extractor, semantic
//! engine, builder, adjacency cache and backfill scheduler together and exposes the
//! ingestion, retrieval and admin operations.
//!
//! Concurrency is bounded per workspace by a semaphore. Within one document every
//! proposal reaches its terminal state before the extraction state is saved, so a
//! document that fails half-way is picked up again by backfill.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::audit::{
    AuditOperation, AuditRecord, AuditRepository, BackfillRun, DeadLetter,
};
use crate::domain::backfill::{
    BackfillProgress, BackfillReport, BackfillScheduler, BackfillTrigger, ExtractionDriver,
};
use crate::domain::documents::{
    Document, DocumentRepository, ExtractionState, ProcessingReport, RegisterOutcome,
    SemanticStatus, StoredDocument,
};
use crate::domain::extraction::ReferenceExtractor;
use crate::domain::graph::{AdjacencyCache, BoostedCandidate, GraphBooster, Neighbor, ScoredCandidate};
use crate::domain::identity::{
    Entity, EntityKind, EntityResolver, IdentityHint, IdentityRepository, MergeResult,
    MergeSuggestion, Resolution, SplitResult, SuggestionStatus,
};
use crate::domain::relationships::{
    BidirectionalBuilder, ConfidenceGate, Direction, PairWrite, PromotionReport,
    ProposalOutcome, Relationship, RelationshipProposal, RelationshipRepository,
    RelationshipStats, RelationshipType, ReviewItem, ReviewStatus, WriteOutcome,
};
use crate::domain::semantic::{JudgmentOracle, SemanticCandidateEngine, VectorIndex};
use crate::error::{Error, Result};
use crate::infrastructure::sqlite::{
    SqliteAuditRepository, SqliteDocumentRepository, SqliteIdentityRepository,
    SqliteRelationshipRepository,
};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::storage::Database;

pub struct RelationshipPipeline {
    config: Config,
    documents: Arc<dyn DocumentRepository>,
    relationships: Arc<dyn RelationshipRepository>,
    identity: Arc<dyn IdentityRepository>,
    audit: Arc<dyn AuditRepository>,
    resolver: Arc<EntityResolver>,
    extractor: ReferenceExtractor,
    semantic: Option<SemanticCandidateEngine>,
    builder: BidirectionalBuilder,
    cache: Arc<AdjacencyCache>,
    scheduler: BackfillScheduler,
    retry: RetryPolicy,
    permits: Mutex<HashMap<String, Arc<Semaphore>>>,
    cache_loading: Mutex<()>,
}

impl RelationshipPipeline {
    /// Build a pipeline over a migrated database
    ///
    /// The semantic stage stays off until [`Self::with_semantic`] supplies a vector
    /// index and an oracle.
    pub fn new(database: &Database, config: Config) -> Result<Self> {
        Self::from_pool(database.pool().clone(), config)
    }

    pub fn from_pool(pool: SqlitePool, config: Config) -> Result<Self> {
        let documents: Arc<dyn DocumentRepository> =
            Arc::new(SqliteDocumentRepository::new(pool.clone()));
        let relationships: Arc<dyn RelationshipRepository> =
            Arc::new(SqliteRelationshipRepository::new(pool.clone()));
        let identity: Arc<dyn IdentityRepository> =
            Arc::new(SqliteIdentityRepository::new(pool.clone()));
        let audit: Arc<dyn AuditRepository> = Arc::new(SqliteAuditRepository::new(pool));

        let resolver = Arc::new(EntityResolver::new(identity.clone(), config.identity));
        let extractor = ReferenceExtractor::new(&config.extraction, resolver.clone())?;
        let cache = Arc::new(AdjacencyCache::new());
        let builder = BidirectionalBuilder::new(
            relationships.clone(),
            documents.clone(),
            cache.clone(),
            ConfidenceGate::new(&config.gate),
        );
        let scheduler = BackfillScheduler::new(
            documents.clone(),
            audit.clone(),
            config.backfill,
            config.extraction.rule_version,
        );

        Ok(Self {
            retry: RetryPolicy::from(&config.retry),
            config,
            documents,
            relationships,
            identity,
            audit,
            resolver,
            extractor,
            semantic: None,
            builder,
            cache,
            scheduler,
            permits: Mutex::new(HashMap::new()),
            cache_loading: Mutex::new(()),
        })
    }

    /// Replace the retry policy used for external calls
    ///
    /// Call before [`Self::with_semantic`]; the engine takes the policy at construction.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enable the semantic stage (ignored when `semantic.enabled` is false)
    pub fn with_semantic(
        mut self,
        index: Arc<dyn VectorIndex>,
        oracle: Arc<dyn JudgmentOracle>,
    ) -> Self {
        if !self.config.semantic.enabled {
            info!("Semantic stage disabled by configuration");
            return self;
        }
        self.semantic = Some(SemanticCandidateEngine::new(
            index,
            oracle,
            self.documents.clone(),
            self.config.semantic.clone(),
            &self.config.oracle,
            self.retry,
        ));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn documents(&self) -> &Arc<dyn DocumentRepository> {
        &self.documents
    }

    pub fn relationships(&self) -> &Arc<dyn RelationshipRepository> {
        &self.relationships
    }

    pub fn identity(&self) -> &Arc<dyn IdentityRepository> {
        &self.identity
    }

    pub fn audit(&self) -> &Arc<dyn AuditRepository> {
        &self.audit
    }

    pub fn cache(&self) -> &Arc<AdjacencyCache> {
        &self.cache
    }

    /// Live counters of the current backfill run
    pub fn backfill_progress(&self) -> Arc<BackfillProgress> {
        self.scheduler.progress()
    }

    // ========== Ingestion ==========

    /// Handle a `document.ingested` event
    ///
    /// A duplicate delivery of already processed content only re-runs promotion.
    pub async fn document_ingested(&self, document: Document) -> Result<ProcessingReport> {
        document.validate()?;
        let _permit = self.acquire(&document.workspace_id).await?;
        self.warm_cache(&document.workspace_id).await?;

        let (stored, registered) = self.documents.register(&document).await?;
        let previous = self.documents.get_extraction_state(&stored.id).await?;

        let up_to_date = previous.as_ref().is_some_and(|state| {
            state.rule_version >= self.config.extraction.rule_version
                && state.semantic_status != SemanticStatus::Skipped
        });
        if registered == RegisterOutcome::Unchanged && up_to_date {
            let promotion = self.builder.promote_for_document(&stored).await?;
            let mut report = ProcessingReport::new(&stored.id);
            report.registered = Some(registered);
            report.promoted = promotion.promoted;
            report.semantic_status = previous
                .map(|s| s.semantic_status)
                .unwrap_or(SemanticStatus::Pending);
            debug!(document_id = %stored.id, "Duplicate delivery, extraction skipped");
            return Ok(report);
        }

        let content_changed = registered != RegisterOutcome::Unchanged;
        let mut report = self.process(&stored, previous, content_changed).await?;
        report.registered = Some(registered);
        Ok(report)
    }

    /// Ingest several documents concurrently; each result is independent
    pub async fn ingest_batch(&self, documents: Vec<Document>) -> Vec<Result<ProcessingReport>> {
        join_all(documents.into_iter().map(|doc| self.document_ingested(doc))).await
    }

    /// Run promotion, extraction, gating and the semantic stage for a stored document
    async fn process(
        &self,
        stored: &StoredDocument,
        previous: Option<ExtractionState>,
        content_changed: bool,
    ) -> Result<ProcessingReport> {
        let mut report = ProcessingReport::new(&stored.id);

        let promotion = self.builder.promote_for_document(stored).await?;
        report.promoted = promotion.promoted;

        let timeout = Duration::from_secs(self.config.pipeline.extraction_timeout_secs.max(1));
        let base = report;
        let (mut report, structural) =
            match retry_with_backoff(&self.retry, "extraction", timeout, || {
                self.extraction_stage(stored, base.clone())
            })
            .await
            {
                Ok(stage) => stage,
                Err(e) if e.is_retryable() => {
                    self.dead_letter_extraction(stored, previous.as_ref(), &e).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

        let prior_status = previous.as_ref().map(|s| s.semantic_status);
        let mut attempts = previous.as_ref().map(|s| s.attempts).unwrap_or(0);
        let mut last_error = None;

        report.semantic_status = match &self.semantic {
            None => SemanticStatus::NotApplicable,
            Some(engine) if structural && !engine.config().always_run => {
                SemanticStatus::NotApplicable
            }
            Some(_) if prior_status == Some(SemanticStatus::Done) && !content_changed => {
                SemanticStatus::Done
            }
            Some(engine) => {
                attempts += 1;
                match engine.propose(stored).await {
                    Ok(outcome) => {
                        report.semantic_proposals = outcome.proposals.len();
                        report.schema_violations = outcome.schema_violations;
                        for proposal in outcome.proposals {
                            self.apply(proposal, &mut report).await?;
                        }
                        SemanticStatus::Done
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(
                            document_id = %stored.id,
                            error = %e,
                            "Semantic stage exhausted retries, marked for backfill"
                        );
                        self.audit
                            .record_dead_letter(&DeadLetter::new(
                                stored.workspace_id(),
                                Some(stored.id.clone()),
                                "semantic",
                                e.to_string(),
                                self.retry.max_attempts,
                            ))
                            .await?;
                        last_error = Some(e.to_string());
                        SemanticStatus::Skipped
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        self.documents
            .save_extraction_state(&ExtractionState {
                document_id: stored.id.clone(),
                rule_version: self.config.extraction.rule_version,
                semantic_status: report.semantic_status,
                attempts,
                last_error,
                processed_at: Utc::now(),
            })
            .await?;

        info!(
            document_id = %stored.id,
            key = %stored.key(),
            created = report.created,
            pending = report.pending,
            review = report.queued_for_review,
            promoted = report.promoted,
            semantic = report.semantic_status.as_str(),
            "Document processed"
        );

        Ok(report)
    }

    /// Extract deterministic proposals and carry each one to its terminal state
    ///
    /// Every write on this path is an idempotent upsert, so a failed attempt can be
    /// re-run from the start.
    async fn extraction_stage(
        &self,
        stored: &StoredDocument,
        mut report: ProcessingReport,
    ) -> Result<(ProcessingReport, bool)> {
        let extraction = self.extractor.extract(stored).await?;
        let structural = extraction.has_document_targets();
        report.deterministic_proposals = extraction.proposals.len();
        for proposal in extraction.proposals {
            self.apply(proposal, &mut report).await?;
        }
        Ok((report, structural))
    }

    /// Park a document whose extraction kept failing
    ///
    /// Rule version 0 keeps it selectable by every later backfill.
    async fn dead_letter_extraction(
        &self,
        stored: &StoredDocument,
        previous: Option<&ExtractionState>,
        error: &Error,
    ) {
        warn!(
            document_id = %stored.id,
            error = %error,
            "Extraction exhausted retries, dead-lettered"
        );

        let letter = DeadLetter::new(
            stored.workspace_id(),
            Some(stored.id.clone()),
            "extraction",
            error,
            self.retry.max_attempts,
        );
        if let Err(e) = self.audit.record_dead_letter(&letter).await {
            warn!(document_id = %stored.id, error = %e, "Could not record dead letter");
        }

        let state = ExtractionState {
            document_id: stored.id.clone(),
            rule_version: 0,
            semantic_status: SemanticStatus::Pending,
            attempts: previous.map(|s| s.attempts).unwrap_or(0),
            last_error: Some(error.to_string()),
            processed_at: Utc::now(),
        };
        if let Err(e) = self.documents.save_extraction_state(&state).await {
            warn!(document_id = %stored.id, error = %e, "Could not save extraction state");
        }
    }

    async fn apply(&self, proposal: RelationshipProposal, report: &mut ProcessingReport) -> Result<()> {
        let applied = match self.builder.apply(proposal).await {
            Ok(applied) => applied,
            Err(e) if e.is_validation() => {
                debug!(document_id = %report.document_id, error = %e, "Proposal skipped");
                report.discarded += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match applied.outcome {
            ProposalOutcome::AcceptedResolved => match applied.write.map(|w| w.outcome) {
                Some(WriteOutcome::Created) => report.created += 1,
                Some(WriteOutcome::Updated) => report.updated += 1,
                Some(_) => {}
                // Saved as pending, then promoted because the target arrived meanwhile
                None => report.promoted += 1,
            },
            ProposalOutcome::AcceptedPending => report.pending += 1,
            ProposalOutcome::QueuedForReview => report.queued_for_review += 1,
            ProposalOutcome::Discarded => report.discarded += 1,
            ProposalOutcome::Rejected => report.rejected += 1,
        }
        Ok(())
    }

    async fn acquire(&self, workspace_id: &str) -> Result<OwnedSemaphorePermit> {
        let semaphore = {
            let mut permits = self.permits.lock().await;
            permits
                .entry(workspace_id.to_string())
                .or_insert_with(|| {
                    Arc::new(Semaphore::new(
                        self.config.pipeline.max_concurrent_per_workspace.max(1),
                    ))
                })
                .clone()
        };

        semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::Fatal("workspace semaphore closed".to_string()))
    }

    // ========== Retrieval ==========

    /// Relationships touching a document or entity, with evidence
    pub async fn get_relationships(
        &self,
        workspace_id: &str,
        node_id: &str,
        direction: Direction,
        type_filter: &[RelationshipType],
    ) -> Result<Vec<Relationship>> {
        self.relationships
            .get_relationships(workspace_id, node_id, direction, type_filter)
            .await
    }

    /// Nodes within `max_hops` (at most 2) of a node, from the adjacency cache
    pub async fn get_neighbors(
        &self,
        workspace_id: &str,
        node_id: &str,
        direction: Direction,
        type_allowlist: &[RelationshipType],
        max_hops: u32,
    ) -> Result<Vec<Neighbor>> {
        self.warm_cache(workspace_id).await?;
        self.cache
            .get_neighbors(workspace_id, node_id, direction, type_allowlist, max_hops)
            .await
    }

    /// Graph boost for retrieval candidates relative to anchor nodes
    pub async fn boost_scores(
        &self,
        workspace_id: &str,
        anchors: &[String],
        candidates: &[ScoredCandidate],
    ) -> Result<Vec<BoostedCandidate>> {
        self.warm_cache(workspace_id).await?;
        GraphBooster::new(self.cache.clone(), self.config.graph.clone())
            .boost_scores(workspace_id, anchors, candidates)
            .await
    }

    /// Rebuild a workspace projection from the store; returns the edge count
    pub async fn rebuild_cache(&self, workspace_id: &str) -> Result<usize> {
        let relationships = self
            .relationships
            .list_workspace_relationships(workspace_id)
            .await?;
        self.cache
            .rebuild_workspace(workspace_id, &relationships)
            .await;
        Ok(relationships.len())
    }

    /// Rebuild every workspace that holds relationships
    pub async fn rebuild_all(&self) -> Result<usize> {
        let mut edges = 0;
        for workspace_id in self.relationships.list_workspaces().await? {
            edges += self.rebuild_cache(&workspace_id).await?;
        }
        Ok(edges)
    }

    /// Load a workspace projection the first time it is touched
    async fn warm_cache(&self, workspace_id: &str) -> Result<()> {
        let _loading = self.cache_loading.lock().await;
        if !self.cache.contains_workspace(workspace_id).await {
            self.rebuild_cache(workspace_id).await?;
        }
        Ok(())
    }

    pub async fn stats(&self, workspace_id: &str) -> Result<RelationshipStats> {
        self.relationships.stats(workspace_id).await
    }

    // ========== Identity ==========

    pub async fn resolve_identity(&self, workspace_id: &str, hint: &IdentityHint) -> Result<Resolution> {
        self.resolver.resolve(workspace_id, hint).await
    }

    pub async fn list_entities(
        &self,
        workspace_id: &str,
        kind: Option<EntityKind>,
    ) -> Result<Vec<Entity>> {
        self.identity.list_entities(workspace_id, kind).await
    }

    pub async fn list_merge_suggestions(
        &self,
        workspace_id: &str,
        status: Option<SuggestionStatus>,
    ) -> Result<Vec<MergeSuggestion>> {
        self.identity.list_suggestions(workspace_id, status).await
    }

    /// Merge one entity into another; audited on success and on failure
    pub async fn merge_entities(
        &self,
        workspace_id: &str,
        from_id: &str,
        into_id: &str,
        reason: &str,
    ) -> Result<MergeResult> {
        match self
            .identity
            .merge_entities(workspace_id, from_id, into_id, reason)
            .await
        {
            Ok(result) => {
                self.rebuild_cache(workspace_id).await?;
                Ok(result)
            }
            Err(e) => {
                self.record_failure(
                    workspace_id,
                    AuditOperation::MergeEntities,
                    vec![from_id.to_string(), into_id.to_string()],
                    reason,
                    &e,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Move aliases off an entity onto a new one; audited on success and on failure
    pub async fn split_entity(
        &self,
        workspace_id: &str,
        entity_id: &str,
        alias_ids: &[String],
        reason: &str,
    ) -> Result<SplitResult> {
        match self
            .identity
            .split_entity(workspace_id, entity_id, alias_ids, reason)
            .await
        {
            Ok(result) => {
                self.rebuild_cache(workspace_id).await?;
                Ok(result)
            }
            Err(e) => {
                let mut subjects = vec![entity_id.to_string()];
                subjects.extend(alias_ids.iter().cloned());
                self.record_failure(workspace_id, AuditOperation::SplitEntity, subjects, reason, &e)
                    .await;
                Err(e)
            }
        }
    }

    async fn record_failure(
        &self,
        workspace_id: &str,
        operation: AuditOperation,
        subjects: Vec<String>,
        reason: &str,
        error: &Error,
    ) {
        let record = AuditRecord::new(workspace_id, operation, subjects, reason).failed(error);
        if let Err(audit_err) = self.audit.record(&record).await {
            warn!(operation = %operation, error = %audit_err, "Could not audit failed operation");
        }
    }

    // ========== Review queue ==========

    pub async fn list_review_items(
        &self,
        workspace_id: &str,
        status: Option<ReviewStatus>,
    ) -> Result<Vec<ReviewItem>> {
        self.relationships.list_review_items(workspace_id, status).await
    }

    async fn open_review_item(&self, workspace_id: &str, review_id: &str) -> Result<ReviewItem> {
        let item = self
            .relationships
            .get_review_item(review_id)
            .await?
            .filter(|item| item.workspace_id == workspace_id)
            .ok_or_else(|| Error::ReviewItemNotFound(review_id.to_string()))?;

        if item.status != ReviewStatus::Open {
            return Err(Error::Validation(format!(
                "review item {} is already {}",
                review_id,
                item.status.as_str()
            )));
        }
        Ok(item)
    }

    /// Approve a review item: write it as a manual relationship pair
    ///
    /// An item whose edge is already covered by a deterministic relationship is closed
    /// as rejected and the approval fails.
    pub async fn approve_review(
        &self,
        workspace_id: &str,
        review_id: &str,
        reason: &str,
    ) -> Result<PairWrite> {
        let result = async {
            let item = self.open_review_item(workspace_id, review_id).await?;
            self.warm_cache(workspace_id).await?;
            let write = self.builder.write(&item.to_manual_relationship(reason)).await?;
            if write.outcome == WriteOutcome::Rejected {
                self.relationships
                    .decide_review(review_id, ReviewStatus::Rejected)
                    .await?;
                return Err(Error::Validation(format!(
                    "review item {} is covered by a deterministic {} relationship",
                    review_id, item.relationship_type
                )));
            }
            self.relationships
                .decide_review(review_id, ReviewStatus::Approved)
                .await?;
            Ok::<_, Error>(write)
        }
        .await;

        match result {
            Ok(write) => {
                let record = AuditRecord::new(
                    workspace_id,
                    AuditOperation::ReviewApproved,
                    vec![review_id.to_string()],
                    reason,
                )
                .with_detail(json!({ "write": write.outcome.as_str() }));
                self.audit.record(&record).await?;
                Ok(write)
            }
            Err(e) => {
                self.record_failure(
                    workspace_id,
                    AuditOperation::ReviewApproved,
                    vec![review_id.to_string()],
                    reason,
                    &e,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Reject a review item; no relationship is written
    pub async fn reject_review(&self, workspace_id: &str, review_id: &str, reason: &str) -> Result<()> {
        let result = async {
            self.open_review_item(workspace_id, review_id).await?;
            if !self
                .relationships
                .decide_review(review_id, ReviewStatus::Rejected)
                .await?
            {
                return Err(Error::Conflict(format!("review item {}", review_id)));
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.audit
                    .record(&AuditRecord::new(
                        workspace_id,
                        AuditOperation::ReviewRejected,
                        vec![review_id.to_string()],
                        reason,
                    ))
                    .await
            }
            Err(e) => {
                self.record_failure(
                    workspace_id,
                    AuditOperation::ReviewRejected,
                    vec![review_id.to_string()],
                    reason,
                    &e,
                )
                .await;
                Err(e)
            }
        }
    }

    // ========== Backfill ==========

    /// Re-drive extraction over historical documents of a workspace
    pub async fn trigger_backfill(&self, trigger: &BackfillTrigger) -> Result<BackfillReport> {
        let result = async {
            self.warm_cache(&trigger.workspace_id).await?;
            self.scheduler.run(self, trigger).await
        }
        .await;

        if let Err(e) = &result {
            self.record_failure(
                &trigger.workspace_id,
                AuditOperation::Backfill,
                Vec::new(),
                trigger.reason.as_str(),
                e,
            )
            .await;
        }
        result
    }

    pub async fn backfill_runs(&self, workspace_id: &str) -> Result<Vec<BackfillRun>> {
        self.audit.list_backfill_runs(workspace_id).await
    }
}

#[async_trait]
impl ExtractionDriver for RelationshipPipeline {
    async fn reprocess(&self, document: &StoredDocument) -> Result<ProcessingReport> {
        let _permit = self.acquire(document.workspace_id()).await?;
        let previous = self.documents.get_extraction_state(&document.id).await?;
        self.process(document, previous, false).await
    }

    async fn promote_ready(&self, workspace_id: &str) -> Result<PromotionReport> {
        self.builder.promote_ready(workspace_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backfill::BackfillReason;
    use crate::domain::documents::DocumentKey;
    use crate::domain::relationships::RelationshipSource;
    use crate::storage::run_migrations;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pipeline_with_pool() -> (RelationshipPipeline, SqlitePool) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool");

        run_migrations(&pool)
            .await
            .expect("Failed to run migrations");

        let mut config = Config::default();
        config.backfill.inter_batch_delay_ms = 0;
        let pipeline = RelationshipPipeline::from_pool(pool.clone(), config)
            .expect("Failed to build pipeline")
            .with_retry_policy(RetryPolicy::immediate(1));
        (pipeline, pool)
    }

    async fn setup_pipeline() -> RelationshipPipeline {
        setup_pipeline_with_pool().await.0
    }

    #[tokio::test]
    async fn test_ingest_rejects_invalid_document() {
        let pipeline = setup_pipeline().await;
        let err = pipeline
            .document_ingested(Document::new("ws", "github", " "))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_author_field_creates_entity_pair() {
        let pipeline = setup_pipeline().await;
        let doc = Document::new("ws", "github", "acme/api#7")
            .with_title("Tidy logging")
            .with_fields(json!({"author": {"id": "42", "login": "octocat"}}));

        let report = pipeline.document_ingested(doc).await.unwrap();
        assert_eq!(report.registered, Some(RegisterOutcome::Created));
        assert_eq!(report.created, 1);
        assert_eq!(report.semantic_status, SemanticStatus::NotApplicable);

        let entities = pipeline.list_entities("ws", Some(EntityKind::Person)).await.unwrap();
        assert_eq!(entities.len(), 1);

        let rels = pipeline
            .get_relationships("ws", &report.document_id, Direction::Outgoing, &[])
            .await
            .unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].relationship_type, RelationshipType::AuthoredBy);
        assert_eq!(rels[0].source, RelationshipSource::Deterministic);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_noop() {
        let pipeline = setup_pipeline().await;
        let doc = Document::new("ws", "github", "acme/api#1").with_body("Fixes LIN-5");

        let first = pipeline.document_ingested(doc.clone()).await.unwrap();
        assert_eq!(first.pending, 1);
        let second = pipeline.document_ingested(doc).await.unwrap();
        assert_eq!(second.registered, Some(RegisterOutcome::Unchanged));
        assert_eq!(second.pending, 0);
        assert_eq!(pipeline.relationships().list_pending("ws").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_merge_failure_is_audited() {
        let pipeline = setup_pipeline().await;
        let err = pipeline
            .merge_entities("ws", "missing-a", "missing-b", "cleanup")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EntityNotFound(_)));

        let audit = pipeline.audit().list("ws", 10).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].operation, AuditOperation::MergeEntities);
    }

    #[tokio::test]
    async fn test_review_not_found() {
        let pipeline = setup_pipeline().await;
        let err = pipeline.approve_review("ws", "nope", "looks right").await.unwrap_err();
        assert!(matches!(err, Error::ReviewItemNotFound(_)));
    }

    #[tokio::test]
    async fn test_backfill_requires_workspace() {
        let pipeline = setup_pipeline().await;
        let err = pipeline
            .trigger_backfill(&BackfillTrigger::new(" ", BackfillReason::Manual))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_extraction_failure_is_dead_lettered() {
        let (pipeline, pool) = setup_pipeline_with_pool().await;
        let pipeline = pipeline.with_retry_policy(RetryPolicy::immediate(2));

        // Every relationship insert fails the way a locked database does
        sqlx::query(
            r#"
            CREATE TRIGGER locked_relationships BEFORE INSERT ON relationships
            BEGIN SELECT RAISE(ABORT, 'database is locked'); END
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let doc = Document::new("ws", "github", "acme/api#9")
            .with_fields(json!({"author": {"id": "42", "login": "octocat"}}));
        let err = pipeline.document_ingested(doc).await.unwrap_err();
        assert!(err.is_retryable());

        let letters = pipeline.audit().list_dead_letters("ws").await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].stage, "extraction");
        assert_eq!(letters[0].attempts, 2);

        let stored = pipeline
            .documents()
            .find_by_key("ws", &DocumentKey::new("github", "acme/api#9"))
            .await
            .unwrap()
            .unwrap();
        let state = pipeline
            .documents()
            .get_extraction_state(&stored.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.rule_version, 0);
        assert!(state.last_error.is_some());

        // once the store recovers, a rule-updated backfill picks the document up again
        sqlx::query("DROP TRIGGER locked_relationships")
            .execute(&pool)
            .await
            .unwrap();
        let report = pipeline
            .trigger_backfill(&BackfillTrigger::new("ws", BackfillReason::RuleUpdated))
            .await
            .unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.created, 1);
        assert_eq!(pipeline.stats("ws").await.unwrap().deterministic, 2);
    }
}
