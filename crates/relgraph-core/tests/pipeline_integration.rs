//! Relgraph Core Integration Tests
//!
//! Drive the pipeline end to end against in-memory SQLite, a scripted oracle and the
//! in-memory vector index.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::json;

use relgraph_core::{
    Error, RelationshipPipeline, Result,
    config::Config,
    domain::backfill::{BackfillReason, BackfillTrigger},
    domain::documents::{Document, DocumentKey, SemanticStatus},
    domain::audit::{AuditOperation, AuditOutcome},
    domain::identity::{EntityKind, IdentityHint},
    domain::relationships::{
        Direction, RelationshipSource, RelationshipType, ReviewStatus, WriteOutcome,
    },
    domain::semantic::{InMemoryVectorIndex, JudgmentOracle, JudgmentRequest},
    retry::RetryPolicy,
    storage::{Database, DatabaseConfig},
};

const WS: &str = "acme";

/// Oracle that labels the first candidate with a fixed type and confidence
struct ScriptedOracle {
    relationship_type: &'static str,
    confidence: f32,
    failing: AtomicBool,
    malformed: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    fn new(relationship_type: &'static str, confidence: f32) -> Arc<Self> {
        Arc::new(Self {
            relationship_type,
            confidence,
            failing: AtomicBool::new(false),
            malformed: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn set_malformed(&self, malformed: bool) {
        self.malformed.store(malformed, Ordering::SeqCst);
    }
}

#[async_trait]
impl JudgmentOracle for ScriptedOracle {
    async fn judge(&self, request: &JudgmentRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::transient("oracle", "503 upstream unavailable"));
        }
        if self.malformed.load(Ordering::SeqCst) {
            return Err(Error::SchemaViolation("oracle returned no content".to_string()));
        }
        let candidate = &request.candidates[0].document;
        Ok(json!({
            "judgments": [{
                "candidate_id": candidate.id,
                "relationship_type": self.relationship_type,
                "confidence": self.confidence,
                "reasoning": "stack trace names the changed function",
                "source_evidence": "NullPointerException in checkout",
                "target_evidence": "fn checkout()"
            }]
        })
        .to_string())
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.backfill.inter_batch_delay_ms = 0;
    config
}

async fn pipeline() -> RelationshipPipeline {
    let db = Database::in_memory().await.expect("Failed to create database");
    RelationshipPipeline::new(&db, test_config())
        .expect("Failed to build pipeline")
        .with_retry_policy(RetryPolicy::immediate(2))
}

async fn semantic_pipeline(oracle: Arc<ScriptedOracle>) -> (RelationshipPipeline, Arc<InMemoryVectorIndex>) {
    semantic_pipeline_with(oracle, test_config()).await
}

async fn semantic_pipeline_with(
    oracle: Arc<ScriptedOracle>,
    config: Config,
) -> (RelationshipPipeline, Arc<InMemoryVectorIndex>) {
    let db = Database::in_memory().await.expect("Failed to create database");
    let index = Arc::new(InMemoryVectorIndex::new());
    let pipeline = RelationshipPipeline::new(&db, config)
        .expect("Failed to build pipeline")
        .with_retry_policy(RetryPolicy::immediate(2))
        .with_semantic(index.clone(), oracle);
    (pipeline, index)
}

fn pull_request() -> Document {
    Document::new(WS, "github", "acme/api#456")
        .with_title("Handle empty carts")
        .with_body("Closes LIN-123 by guarding the checkout path.")
}

fn linear_issue() -> Document {
    Document::new(WS, "linear", "LIN-123")
        .with_title("Checkout crashes on empty cart")
        .with_body("Users report a crash when the cart is empty.")
}

fn support_ticket() -> Document {
    Document::new(WS, "zendesk", "4711")
        .with_title("Checkout page errors")
        .with_body("Customer sees NullPointerException in checkout after removing items.")
}

fn code_file() -> Document {
    Document::new(WS, "code", "acme/api:src/checkout.rs")
        .with_title("src/checkout.rs")
        .with_body("pub fn checkout(cart: &Cart) -> Receipt { ... }")
}

/// Seed embeddings so the ticket and the code file are 0.78 apart
async fn seed_vectors(index: &InMemoryVectorIndex) {
    index
        .upsert(WS, DocumentKey::new("zendesk", "4711"), vec![1.0, 0.0])
        .await;
    index
        .upsert(
            WS,
            DocumentKey::new("code", "acme/api:src/checkout.rs"),
            vec![0.78, (1.0f32 - 0.78 * 0.78).sqrt()],
        )
        .await;
}

/// Resolved edges rendered with natural keys, so graphs from different stores compare
async fn graph_by_key(pipeline: &RelationshipPipeline) -> BTreeSet<String> {
    let mut edges = BTreeSet::new();
    for rel in pipeline
        .relationships()
        .list_workspace_relationships(WS)
        .await
        .unwrap()
    {
        let from = pipeline.documents().get_document(&rel.from.id).await.unwrap();
        let to = pipeline.documents().get_document(&rel.to.id).await.unwrap();
        edges.insert(format!(
            "{} -{}:{:.2}-> {}",
            from.map(|d| d.key().to_string()).unwrap_or(rel.from.id.clone()),
            rel.relationship_type,
            rel.confidence,
            to.map(|d| d.key().to_string()).unwrap_or(rel.to.id.clone()),
        ));
    }
    edges
}

#[tokio::test]
async fn test_pending_reference_promoted_when_target_arrives() {
    let pipeline = pipeline().await;

    let pr = pipeline.document_ingested(pull_request()).await.unwrap();
    assert_eq!(pr.pending, 1);
    assert_eq!(pr.created, 0);

    let pending = pipeline.relationships().list_pending(WS).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].target, DocumentKey::new("linear", "LIN-123"));
    assert_eq!(pending[0].relationship_type, RelationshipType::Resolves);

    let issue = pipeline.document_ingested(linear_issue()).await.unwrap();
    assert_eq!(issue.promoted, 1);
    assert!(pipeline.relationships().list_pending(WS).await.unwrap().is_empty());

    let forward = pipeline
        .get_relationships(WS, &pr.document_id, Direction::Outgoing, &[RelationshipType::Resolves])
        .await
        .unwrap();
    assert_eq!(forward.len(), 1);
    assert_eq!(forward[0].to.id, issue.document_id);
    assert!((forward[0].confidence - 0.95).abs() < 1e-6);
    assert_eq!(forward[0].source, RelationshipSource::Deterministic);
    assert!(!forward[0].evidence.is_empty());

    let reverse = pipeline
        .get_relationships(WS, &issue.document_id, Direction::Outgoing, &[])
        .await
        .unwrap();
    assert_eq!(reverse.len(), 1);
    assert_eq!(reverse[0].relationship_type, RelationshipType::ResolvedBy);
    assert_eq!(reverse[0].to.id, pr.document_id);
    assert!((reverse[0].confidence - forward[0].confidence).abs() < 1e-6);
}

#[tokio::test]
async fn test_ingestion_order_does_not_change_graph() {
    let first = pipeline().await;
    first.document_ingested(pull_request()).await.unwrap();
    first.document_ingested(linear_issue()).await.unwrap();

    let second = pipeline().await;
    second.document_ingested(linear_issue()).await.unwrap();
    second.document_ingested(pull_request()).await.unwrap();

    let third = pipeline().await;
    for result in third.ingest_batch(vec![linear_issue(), pull_request()]).await {
        result.unwrap();
    }

    let expected = graph_by_key(&first).await;
    assert_eq!(expected.len(), 2);
    assert_eq!(graph_by_key(&second).await, expected);
    assert_eq!(graph_by_key(&third).await, expected);
    assert!(third.relationships().list_pending(WS).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_semantic_judgment_creates_pair() {
    let oracle = ScriptedOracle::new("CAUSED_BY", 0.88);
    let (pipeline, index) = semantic_pipeline(oracle.clone()).await;
    seed_vectors(&index).await;

    let file = pipeline.document_ingested(code_file()).await.unwrap();
    let ticket = pipeline.document_ingested(support_ticket()).await.unwrap();
    assert_eq!(ticket.semantic_status, SemanticStatus::Done);
    assert_eq!(ticket.created, 1);

    let forward = pipeline
        .get_relationships(WS, &ticket.document_id, Direction::Outgoing, &[])
        .await
        .unwrap();
    assert_eq!(forward.len(), 1);
    assert_eq!(forward[0].relationship_type, RelationshipType::CausedBy);
    assert_eq!(forward[0].source, RelationshipSource::Semantic);
    assert_eq!(forward[0].to.id, file.document_id);

    let reverse = pipeline
        .get_relationships(WS, &file.document_id, Direction::Outgoing, &[RelationshipType::Causes])
        .await
        .unwrap();
    assert_eq!(reverse.len(), 1);
    assert_eq!(reverse[0].source, RelationshipSource::Semantic);

    // Unchanged redelivery does not ask the oracle again
    let calls = oracle.calls.load(Ordering::SeqCst);
    pipeline.document_ingested(support_ticket()).await.unwrap();
    assert_eq!(oracle.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_review_band_judgment_is_queued() {
    let (pipeline, index) = semantic_pipeline(ScriptedOracle::new("CAUSED_BY", 0.65)).await;
    seed_vectors(&index).await;

    pipeline.document_ingested(code_file()).await.unwrap();
    let ticket = pipeline.document_ingested(support_ticket()).await.unwrap();
    assert_eq!(ticket.queued_for_review, 1);
    assert_eq!(ticket.created, 0);
    assert_eq!(pipeline.relationships().count_relationships(WS).await.unwrap(), 0);

    let items = pipeline.list_review_items(WS, Some(ReviewStatus::Open)).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].relationship_type, RelationshipType::CausedBy);
    assert!((items[0].confidence - 0.65).abs() < 1e-6);
}

#[tokio::test]
async fn test_low_confidence_judgment_is_discarded() {
    let (pipeline, index) = semantic_pipeline(ScriptedOracle::new("CAUSED_BY", 0.4)).await;
    seed_vectors(&index).await;

    pipeline.document_ingested(code_file()).await.unwrap();
    let ticket = pipeline.document_ingested(support_ticket()).await.unwrap();
    assert_eq!(ticket.discarded, 1);

    let stats = pipeline.stats(WS).await.unwrap();
    assert_eq!(stats.relationships, 0);
    assert_eq!(stats.open_reviews, 0);
}

#[tokio::test]
async fn test_approving_review_writes_manual_pair() {
    let (pipeline, index) = semantic_pipeline(ScriptedOracle::new("CAUSED_BY", 0.7)).await;
    seed_vectors(&index).await;

    pipeline.document_ingested(code_file()).await.unwrap();
    let ticket = pipeline.document_ingested(support_ticket()).await.unwrap();
    let item = pipeline
        .list_review_items(WS, Some(ReviewStatus::Open))
        .await
        .unwrap()
        .remove(0);

    let write = pipeline.approve_review(WS, &item.id, "confirmed with on-call").await.unwrap();
    assert_eq!(write.outcome, WriteOutcome::Created);

    let rels = pipeline
        .get_relationships(WS, &ticket.document_id, Direction::Outgoing, &[])
        .await
        .unwrap();
    assert_eq!(rels.len(), 1);
    assert_eq!(rels[0].source, RelationshipSource::Manual);

    // A decided item cannot be decided again
    let err = pipeline.reject_review(WS, &item.id, "changed my mind").await.unwrap_err();
    assert!(err.is_validation());

    let audit = pipeline.audit().list(WS, 10).await.unwrap();
    assert_eq!(audit.len(), 2);
    let approval = audit
        .iter()
        .find(|r| r.operation == AuditOperation::ReviewApproved)
        .unwrap();
    assert_eq!(approval.detail["write"], "created");
}

#[tokio::test]
async fn test_oracle_outage_marks_document_for_backfill() {
    let oracle = ScriptedOracle::new("CAUSED_BY", 0.88);
    let (pipeline, index) = semantic_pipeline(oracle.clone()).await;
    seed_vectors(&index).await;

    pipeline.document_ingested(code_file()).await.unwrap();
    oracle.set_failing(true);
    let ticket = pipeline.document_ingested(support_ticket()).await.unwrap();
    assert_eq!(ticket.semantic_status, SemanticStatus::Skipped);
    assert_eq!(ticket.created, 0);

    let letters = pipeline.audit().list_dead_letters(WS).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].stage, "semantic");
    assert_eq!(letters[0].document_id.as_deref(), Some(ticket.document_id.as_str()));

    oracle.set_failing(false);
    let report = pipeline
        .trigger_backfill(&BackfillTrigger::new(WS, BackfillReason::RuleUpdated))
        .await
        .unwrap();
    assert_eq!(report.failed, 0);
    assert!(report.created >= 1);

    let state = pipeline
        .documents()
        .get_extraction_state(&ticket.document_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.semantic_status, SemanticStatus::Done);
}

#[tokio::test]
async fn test_repeated_backfill_is_idempotent() {
    let pipeline = pipeline().await;
    pipeline.document_ingested(pull_request()).await.unwrap();
    pipeline.document_ingested(linear_issue()).await.unwrap();
    let before = pipeline.relationships().count_relationships(WS).await.unwrap();

    let trigger = BackfillTrigger::new(WS, BackfillReason::Manual);
    let first = pipeline.trigger_backfill(&trigger).await.unwrap();
    let after_first = pipeline.relationships().count_relationships(WS).await.unwrap();
    let second = pipeline.trigger_backfill(&trigger).await.unwrap();
    let after_second = pipeline.relationships().count_relationships(WS).await.unwrap();

    assert_eq!(first.processed, 2);
    assert_eq!(second.processed, 2);
    assert_eq!(second.created, 0);
    assert_eq!(before, after_first);
    assert_eq!(after_first, after_second);
    assert_eq!(pipeline.backfill_runs(WS).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_stored_relationships_respect_gate() {
    let oracle = ScriptedOracle::new("RELATED_TO", 0.62);
    let (pipeline, index) = semantic_pipeline(oracle).await;
    seed_vectors(&index).await;

    pipeline.document_ingested(pull_request()).await.unwrap();
    pipeline.document_ingested(linear_issue()).await.unwrap();
    pipeline.document_ingested(code_file()).await.unwrap();
    pipeline.document_ingested(support_ticket()).await.unwrap();

    let rels = pipeline
        .relationships()
        .list_workspace_relationships(WS)
        .await
        .unwrap();
    assert!(!rels.is_empty());
    for rel in &rels {
        assert!(rel.confidence >= 0.80, "{} stored at {}", rel.id, rel.confidence);
        let reverses = rels.iter().filter(|other| rel.is_reverse_of(other)).count();
        assert_eq!(reverses, 1, "{} has {} reverse rows", rel.id, reverses);
    }
}

#[tokio::test]
async fn test_merge_rewrites_edges_and_neighbors() {
    let pipeline = pipeline().await;
    let pr = pipeline
        .document_ingested(
            pull_request().with_fields(json!({"author": {"id": "1", "login": "alice"}})),
        )
        .await
        .unwrap();
    let issue = pipeline
        .document_ingested(
            linear_issue().with_fields(json!({"author": {"id": "u-9", "name": "Alice Liddell"}})),
        )
        .await
        .unwrap();

    let people = pipeline.list_entities(WS, Some(EntityKind::Person)).await.unwrap();
    assert_eq!(people.len(), 2);
    let (from, into) = (&people[0], &people[1]);

    pipeline
        .merge_entities(WS, &from.id, &into.id, "same person")
        .await
        .unwrap();
    assert_eq!(pipeline.list_entities(WS, Some(EntityKind::Person)).await.unwrap().len(), 1);

    let authored = pipeline
        .get_relationships(WS, &into.id, Direction::Outgoing, &[RelationshipType::Authored])
        .await
        .unwrap();
    assert_eq!(authored.len(), 2);

    let neighbors = pipeline
        .get_neighbors(WS, &pr.document_id, Direction::Outgoing, &[RelationshipType::AuthoredBy, RelationshipType::Authored], 2)
        .await
        .unwrap();
    let person = neighbors.iter().find(|n| n.node_id == into.id).unwrap();
    assert_eq!(person.hop, 1);
    let other_doc = neighbors.iter().find(|n| n.node_id == issue.document_id).unwrap();
    assert_eq!(other_doc.hop, 2);
}

#[tokio::test]
async fn test_malformed_oracle_reply_is_discarded() {
    let oracle = ScriptedOracle::new("CAUSED_BY", 0.88);
    let (pipeline, index) = semantic_pipeline(oracle.clone()).await;
    seed_vectors(&index).await;
    oracle.set_malformed(true);

    pipeline.document_ingested(code_file()).await.unwrap();
    let ticket = pipeline.document_ingested(support_ticket()).await.unwrap();
    assert_eq!(ticket.schema_violations, 1);
    assert_eq!(ticket.semantic_status, SemanticStatus::Done);
    assert_eq!(ticket.created, 0);
    assert_eq!(ticket.queued_for_review, 0);

    assert!(pipeline.audit().list_dead_letters(WS).await.unwrap().is_empty());
    let state = pipeline
        .documents()
        .get_extraction_state(&ticket.document_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.semantic_status, SemanticStatus::Done);
}

#[tokio::test]
async fn test_review_band_blocked_by_deterministic_edge() {
    let mut config = test_config();
    config.semantic.always_run = true;
    let (pipeline, index) =
        semantic_pipeline_with(ScriptedOracle::new("RESOLVES", 0.7), config).await;
    index
        .upsert(WS, DocumentKey::new("github", "acme/api#456"), vec![1.0, 0.0])
        .await;
    index
        .upsert(WS, DocumentKey::new("linear", "LIN-123"), vec![0.95, 0.05])
        .await;

    pipeline.document_ingested(linear_issue()).await.unwrap();
    let pr = pipeline.document_ingested(pull_request()).await.unwrap();
    assert_eq!(pr.created, 1);
    assert_eq!(pr.semantic_status, SemanticStatus::Done);
    assert_eq!(pr.queued_for_review, 0);
    assert_eq!(pr.rejected, 1);

    let stats = pipeline.stats(WS).await.unwrap();
    assert_eq!(stats.open_reviews, 0);
    assert_eq!(stats.semantic, 0);
}

#[tokio::test]
async fn test_approval_fails_once_deterministic_edge_exists() {
    let (pipeline, index) = semantic_pipeline(ScriptedOracle::new("CAUSED_BY", 0.65)).await;
    seed_vectors(&index).await;

    pipeline.document_ingested(code_file()).await.unwrap();
    pipeline.document_ingested(support_ticket()).await.unwrap();
    let item = pipeline
        .list_review_items(WS, Some(ReviewStatus::Open))
        .await
        .unwrap()
        .remove(0);

    // the ticket is re-delivered with an explicit link to the same file
    let linked = support_ticket().with_fields(json!({
        "linked_items": [{
            "source_type": "code",
            "source_id": "acme/api:src/checkout.rs",
            "relation": "caused_by"
        }]
    }));
    let ticket = pipeline.document_ingested(linked).await.unwrap();
    assert_eq!(ticket.created, 1);

    let err = pipeline
        .approve_review(WS, &item.id, "confirmed with on-call")
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let decided = pipeline
        .list_review_items(WS, Some(ReviewStatus::Rejected))
        .await
        .unwrap();
    assert_eq!(decided.len(), 1);
    assert_eq!(decided[0].id, item.id);

    let stats = pipeline.stats(WS).await.unwrap();
    assert_eq!(stats.manual, 0);
    assert_eq!(stats.deterministic, 2);

    let audit = pipeline.audit().list(WS, 10).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].outcome, AuditOutcome::Failure);
}

#[tokio::test]
async fn test_mixed_case_reference_is_promoted() {
    let pipeline = pipeline().await;

    let pr = pipeline
        .document_ingested(
            Document::new(WS, "github", "acme/web#3")
                .with_body("Fixes https://github.com/Acme/API/issues/7"),
        )
        .await
        .unwrap();
    assert_eq!(pr.pending, 1);

    let issue = pipeline
        .document_ingested(Document::new(WS, "github", "Acme/API#7").with_title("Crash"))
        .await
        .unwrap();
    assert_eq!(issue.promoted, 1);
    assert!(pipeline.relationships().list_pending(WS).await.unwrap().is_empty());

    let forward = pipeline
        .get_relationships(WS, &pr.document_id, Direction::Outgoing, &[RelationshipType::Resolves])
        .await
        .unwrap();
    assert_eq!(forward.len(), 1);
    assert_eq!(forward[0].to.id, issue.document_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolution_and_delivery_converge() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = Database::new(DatabaseConfig::with_path(dir.path().join("relgraph.db")).max_connections(8))
        .await
        .expect("Failed to create database");
    let pipeline = RelationshipPipeline::new(&db, test_config())
        .expect("Failed to build pipeline")
        .with_retry_policy(RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        });

    let hint = IdentityHint::person("github")
        .with_source_id("7")
        .with_handle("alice");
    let resolutions = join_all((0..16).map(|_| pipeline.resolve_identity(WS, &hint))).await;
    let ids: BTreeSet<String> = resolutions
        .into_iter()
        .map(|r| r.unwrap().entity_id)
        .collect();
    assert_eq!(ids.len(), 1);
    assert_eq!(
        pipeline.list_entities(WS, Some(EntityKind::Person)).await.unwrap().len(),
        1
    );

    let pr = pipeline.document_ingested(pull_request()).await.unwrap();
    assert_eq!(pr.pending, 1);

    let deliveries = join_all((0..8).map(|_| pipeline.document_ingested(linear_issue()))).await;
    for delivery in deliveries {
        delivery.unwrap();
    }

    assert_eq!(pipeline.relationships().count_relationships(WS).await.unwrap(), 2);
    assert!(pipeline.relationships().list_pending(WS).await.unwrap().is_empty());
    let forward = pipeline
        .get_relationships(WS, &pr.document_id, Direction::Outgoing, &[RelationshipType::Resolves])
        .await
        .unwrap();
    assert_eq!(forward.len(), 1);
}
