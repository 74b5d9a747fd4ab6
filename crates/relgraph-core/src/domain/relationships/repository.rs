//! Repository trait for the relationship store
//!
//! Every resolved edge enters the store through [`RelationshipRepository::write_pair`]
//! or [`RelationshipRepository::promote_pending`]; both run the same guarded write
//! inside one transaction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::documents::DocumentKey;
use crate::error::Result;

use super::pending::PendingRelationship;
use super::relationship::{Endpoint, Relationship, RelationshipType};
use super::review::{ReviewItem, ReviewStatus};

/// Direction for relationship lookups and traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Edges leaving the node
    #[default]
    Outgoing,
    /// Edges arriving at the node
    Incoming,
    /// Both
    Both,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "outgoing" | "out" | "forward" => Some(Self::Outgoing),
            "incoming" | "in" | "backward" => Some(Self::Incoming),
            "both" => Some(Self::Both),
            _ => None,
        }
    }
}

/// Result of a guarded pair write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    /// Both edges were inserted
    Created,
    /// The pair existed; confidence was raised
    Updated,
    /// The pair existed; at most new evidence was attached
    Unchanged,
    /// A deterministic edge already covers `(from, to, type)`
    Rejected,
}

impl WriteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a pair write did to the store
#[derive(Debug, Clone)]
pub struct PairWrite {
    pub outcome: WriteOutcome,
    /// Stored forward edge (absent when rejected)
    pub forward: Option<Relationship>,
    /// Stored reverse edge (absent when rejected)
    pub reverse: Option<Relationship>,
    /// Semantic edges deleted because a deterministic pair replaced them
    pub superseded: Vec<Relationship>,
}

impl PairWrite {
    pub fn rejected() -> Self {
        Self {
            outcome: WriteOutcome::Rejected,
            forward: None,
            reverse: None,
            superseded: Vec::new(),
        }
    }

    pub fn is_created(&self) -> bool {
        self.outcome == WriteOutcome::Created
    }
}

/// Counts for one workspace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationshipStats {
    pub relationships: u64,
    pub deterministic: u64,
    pub semantic: u64,
    pub manual: u64,
    pub pending: u64,
    pub open_reviews: u64,
}

/// Repository trait for relationship persistence
#[async_trait]
pub trait RelationshipRepository: Send + Sync {
    // ========== Resolved relationships ==========

    /// Write a relationship together with its reverse, atomically
    ///
    /// Idempotent under the `(workspace, from, to, type, source)` uniqueness constraint.
    async fn write_pair(&self, relationship: &Relationship) -> Result<PairWrite>;

    /// Promote a pending row to a resolved pair and delete the row, atomically
    ///
    /// Returns `None` when the pending row was already consumed.
    async fn promote_pending(
        &self,
        pending: &PendingRelationship,
        target: &Endpoint,
    ) -> Result<Option<PairWrite>>;

    /// Get a relationship by ID
    async fn get_relationship(&self, id: &str) -> Result<Option<Relationship>>;

    /// Relationships touching a node, with evidence
    async fn get_relationships(
        &self,
        workspace_id: &str,
        node_id: &str,
        direction: Direction,
        type_filter: &[RelationshipType],
    ) -> Result<Vec<Relationship>>;

    /// All relationships of a workspace, without evidence
    async fn list_workspace_relationships(&self, workspace_id: &str) -> Result<Vec<Relationship>>;

    /// Workspaces that hold at least one relationship
    async fn list_workspaces(&self) -> Result<Vec<String>>;

    /// Count relationships in a workspace
    async fn count_relationships(&self, workspace_id: &str) -> Result<u64>;

    // ========== Pending relationships ==========

    /// Insert a pending row, or refresh the existing one for the same proposal
    async fn save_pending(&self, pending: &PendingRelationship) -> Result<PendingRelationship>;

    /// Pending rows waiting for a given target document
    async fn pending_for_target(
        &self,
        workspace_id: &str,
        target: &DocumentKey,
    ) -> Result<Vec<PendingRelationship>>;

    /// All pending rows of a workspace
    async fn list_pending(&self, workspace_id: &str) -> Result<Vec<PendingRelationship>>;

    /// Record a failed promotion attempt
    async fn record_pending_failure(&self, pending_id: &str, error: &str) -> Result<()>;

    // ========== Review queue ==========

    /// Enqueue a review item; an open item for the same edge is refreshed instead
    ///
    /// Returns `None` when a deterministic edge already covers `(from, to, type)`.
    async fn enqueue_review(&self, item: &ReviewItem) -> Result<Option<ReviewItem>>;

    async fn get_review_item(&self, id: &str) -> Result<Option<ReviewItem>>;

    async fn list_review_items(
        &self,
        workspace_id: &str,
        status: Option<ReviewStatus>,
    ) -> Result<Vec<ReviewItem>>;

    /// Close an open review item; returns false if it was not open
    async fn decide_review(&self, id: &str, status: ReviewStatus) -> Result<bool>;

    // ========== Stats ==========

    async fn stats(&self, workspace_id: &str) -> Result<RelationshipStats>;
}
