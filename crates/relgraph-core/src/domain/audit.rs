//! Audit trail, dead letters and backfill run records
//!
//! Every administrative operation leaves an [`AuditRecord`], whether it succeeded or not.
//! Dependency failures that exhaust their retries land in [`DeadLetter`] rows so nothing
//! is dropped silently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::backfill::BackfillReason;
use crate::error::Result;

/// Audited operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    MergeEntities,
    SplitEntity,
    Backfill,
    ReviewApproved,
    ReviewRejected,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MergeEntities => "merge_entities",
            Self::SplitEntity => "split_entity",
            Self::Backfill => "backfill",
            Self::ReviewApproved => "review_approved",
            Self::ReviewRejected => "review_rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "merge_entities" => Some(Self::MergeEntities),
            "split_entity" => Some(Self::SplitEntity),
            "backfill" => Some(Self::Backfill),
            "review_approved" => Some(Self::ReviewApproved),
            "review_rejected" => Some(Self::ReviewRejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

/// One audited administrative action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub workspace_id: String,
    pub operation: AuditOperation,
    /// Entities, review items or runs the operation touched
    pub subject_ids: Vec<String>,
    pub reason: String,
    pub outcome: AuditOutcome,
    /// Operation-specific result or error details
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        workspace_id: impl Into<String>,
        operation: AuditOperation,
        subject_ids: Vec<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            operation,
            subject_ids,
            reason: reason.into(),
            outcome: AuditOutcome::Success,
            detail: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    /// Mark the operation failed, keeping the error message in `detail`
    pub fn failed(mut self, error: impl std::fmt::Display) -> Self {
        self.outcome = AuditOutcome::Failure;
        self.detail = serde_json::json!({ "error": error.to_string() });
        self
    }
}

/// A stage that gave up on a document after exhausting retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub workspace_id: String,
    pub document_id: Option<String>,
    /// Pipeline stage, e.g. `semantic` or `extraction`
    pub stage: String,
    pub error: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        workspace_id: impl Into<String>,
        document_id: Option<String>,
        stage: impl Into<String>,
        error: impl std::fmt::Display,
        attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            document_id,
            stage: stage.into(),
            error: error.to_string(),
            attempts,
            created_at: Utc::now(),
        }
    }
}

/// Persisted summary of one backfill run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillRun {
    pub id: String,
    pub workspace_id: String,
    pub reason: BackfillReason,
    /// Source type filter and cutoff the run used
    pub filter: serde_json::Value,
    pub scanned: u64,
    pub processed: u64,
    pub created: u64,
    pub skipped: u64,
    pub failed: u64,
    pub failures: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<()>;

    /// Most recent first
    async fn list(&self, workspace_id: &str, limit: u32) -> Result<Vec<AuditRecord>>;

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<()>;

    async fn list_dead_letters(&self, workspace_id: &str) -> Result<Vec<DeadLetter>>;

    /// Insert or update a run by id
    async fn save_backfill_run(&self, run: &BackfillRun) -> Result<()>;

    /// Most recent first
    async fn list_backfill_runs(&self, workspace_id: &str) -> Result<Vec<BackfillRun>>;
}
