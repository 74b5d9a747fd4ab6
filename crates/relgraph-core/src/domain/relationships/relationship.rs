//! Relationships between documents and entities
//!
//! A relationship is a typed, confidence-scored, evidenced directed edge between two
//! resolved endpoints. Every relationship is stored together with its reverse edge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A resolved relationship between two endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    /// Unique identifier for the relationship
    pub id: String,
    /// Workspace the edge belongs to
    pub workspace_id: String,
    /// Type of relationship
    pub relationship_type: RelationshipType,
    /// Source endpoint
    pub from: Endpoint,
    /// Target endpoint
    pub to: Endpoint,
    /// Confidence in the relationship (0.0 to 1.0)
    pub confidence: f32,
    /// Where the relationship came from
    pub source: RelationshipSource,
    /// Lifecycle status
    pub status: RelationshipStatus,
    /// Evidence supporting this relationship
    pub evidence: Vec<RelationshipEvidence>,
    /// When the relationship was created
    pub created_at: DateTime<Utc>,
    /// When the relationship was last updated
    pub updated_at: DateTime<Utc>,
}

impl Relationship {
    /// Create a new relationship between two endpoints
    pub fn new(
        workspace_id: impl Into<String>,
        from: Endpoint,
        to: Endpoint,
        relationship_type: RelationshipType,
        source: RelationshipSource,
    ) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            relationship_type,
            from,
            to,
            confidence: 1.0,
            source,
            status: RelationshipStatus::Resolved,
            evidence: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the confidence
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Attach evidence
    pub fn with_evidence(mut self, evidence: Vec<RelationshipEvidence>) -> Self {
        self.evidence = evidence;
        self
    }

    /// Build the paired reverse edge
    ///
    /// The reverse carries the inverse type, the same confidence, source and evidence.
    pub fn reverse(&self) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: self.workspace_id.clone(),
            relationship_type: self.relationship_type.inverse(),
            from: self.to.clone(),
            to: self.from.clone(),
            confidence: self.confidence,
            source: self.source,
            status: self.status,
            evidence: self.evidence.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `other` is the paired reverse of this edge
    pub fn is_reverse_of(&self, other: &Relationship) -> bool {
        self.workspace_id == other.workspace_id
            && self.from == other.to
            && self.to == other.from
            && self.source == other.source
            && self.relationship_type.inverse() == other.relationship_type
    }

    /// Whether this is a self-loop
    pub fn is_self_loop(&self) -> bool {
        self.from.id == self.to.id
    }
}

/// Kind of node a relationship endpoint points to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Document,
    Entity,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Entity => "entity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "document" => Some(Self::Document),
            "entity" => Some(Self::Entity),
            _ => None,
        }
    }
}

/// One end of a relationship
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub kind: NodeKind,
    pub id: String,
}

impl Endpoint {
    pub fn document(id: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Document,
            id: id.into(),
        }
    }

    pub fn entity(id: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Entity,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Where a relationship came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipSource {
    /// Structural fields and text rules
    Deterministic,
    /// Vector search plus oracle judgment
    Semantic,
    /// Approved by a person from the review queue
    Manual,
}

impl RelationshipSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::Semantic => "semantic",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deterministic" => Some(Self::Deterministic),
            "semantic" => Some(Self::Semantic),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Lifecycle status of a stored relationship
///
/// Only resolved relationships are stored; unresolved proposals live in the
/// pending store until their target arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipStatus {
    Resolved,
}

impl RelationshipStatus {
    pub fn as_str(&self) -> &'static str {
        "resolved"
    }
}

/// Types of relationships between documents and entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    /// Source closes/fixes target (e.g. a PR resolving an issue)
    Resolves,
    /// Inverse of Resolves
    ResolvedBy,
    /// Source mentions or links to target
    References,
    /// Inverse of References
    ReferencedBy,
    /// Source was written by target person
    AuthoredBy,
    /// Inverse of AuthoredBy
    Authored,
    /// Source is assigned to target person
    AssignedTo,
    /// Inverse of AssignedTo
    AssigneeOf,
    /// Source was reviewed by target person
    ReviewedBy,
    /// Inverse of ReviewedBy
    Reviewed,
    /// Source changes target file
    Modifies,
    /// Inverse of Modifies
    ModifiedBy,
    /// Source carries target label
    Labeled,
    /// Inverse of Labeled
    LabelOf,
    /// Source belongs to target repo/project
    PartOf,
    /// Inverse of PartOf
    Contains,
    /// Source impacts target service
    Affects,
    /// Inverse of Affects
    AffectedBy,
    /// Source was caused by target
    CausedBy,
    /// Inverse of CausedBy
    Causes,
    /// Source blocks target
    Blocks,
    /// Inverse of Blocks
    BlockedBy,
    /// Source deployment ships target
    Deploys,
    /// Inverse of Deploys
    DeployedBy,
    /// Generic relation (symmetric)
    RelatedTo,
    /// Source duplicates target (symmetric)
    Duplicates,
}

impl RelationshipType {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolves => "resolves",
            Self::ResolvedBy => "resolved_by",
            Self::References => "references",
            Self::ReferencedBy => "referenced_by",
            Self::AuthoredBy => "authored_by",
            Self::Authored => "authored",
            Self::AssignedTo => "assigned_to",
            Self::AssigneeOf => "assignee_of",
            Self::ReviewedBy => "reviewed_by",
            Self::Reviewed => "reviewed",
            Self::Modifies => "modifies",
            Self::ModifiedBy => "modified_by",
            Self::Labeled => "labeled",
            Self::LabelOf => "label_of",
            Self::PartOf => "part_of",
            Self::Contains => "contains",
            Self::Affects => "affects",
            Self::AffectedBy => "affected_by",
            Self::CausedBy => "caused_by",
            Self::Causes => "causes",
            Self::Blocks => "blocks",
            Self::BlockedBy => "blocked_by",
            Self::Deploys => "deploys",
            Self::DeployedBy => "deployed_by",
            Self::RelatedTo => "related_to",
            Self::Duplicates => "duplicates",
        }
    }

    /// Parse from string (case-insensitive, accepts `CAUSED_BY` and `caused-by`)
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        Self::all()
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
    }

    /// Get all relationship types
    pub fn all() -> &'static [RelationshipType] {
        &[
            Self::Resolves,
            Self::ResolvedBy,
            Self::References,
            Self::ReferencedBy,
            Self::AuthoredBy,
            Self::Authored,
            Self::AssignedTo,
            Self::AssigneeOf,
            Self::ReviewedBy,
            Self::Reviewed,
            Self::Modifies,
            Self::ModifiedBy,
            Self::Labeled,
            Self::LabelOf,
            Self::PartOf,
            Self::Contains,
            Self::Affects,
            Self::AffectedBy,
            Self::CausedBy,
            Self::Causes,
            Self::Blocks,
            Self::BlockedBy,
            Self::Deploys,
            Self::DeployedBy,
            Self::RelatedTo,
            Self::Duplicates,
        ]
    }

    /// Check if this relationship type is its own inverse
    pub fn is_symmetric(&self) -> bool {
        matches!(self, Self::RelatedTo | Self::Duplicates)
    }

    /// Get the inverse of this relationship type
    ///
    /// Symmetric types map to themselves.
    pub fn inverse(&self) -> Self {
        match self {
            Self::Resolves => Self::ResolvedBy,
            Self::ResolvedBy => Self::Resolves,
            Self::References => Self::ReferencedBy,
            Self::ReferencedBy => Self::References,
            Self::AuthoredBy => Self::Authored,
            Self::Authored => Self::AuthoredBy,
            Self::AssignedTo => Self::AssigneeOf,
            Self::AssigneeOf => Self::AssignedTo,
            Self::ReviewedBy => Self::Reviewed,
            Self::Reviewed => Self::ReviewedBy,
            Self::Modifies => Self::ModifiedBy,
            Self::ModifiedBy => Self::Modifies,
            Self::Labeled => Self::LabelOf,
            Self::LabelOf => Self::Labeled,
            Self::PartOf => Self::Contains,
            Self::Contains => Self::PartOf,
            Self::Affects => Self::AffectedBy,
            Self::AffectedBy => Self::Affects,
            Self::CausedBy => Self::Causes,
            Self::Causes => Self::CausedBy,
            Self::Blocks => Self::BlockedBy,
            Self::BlockedBy => Self::Blocks,
            Self::Deploys => Self::DeployedBy,
            Self::DeployedBy => Self::Deploys,
            Self::RelatedTo => Self::RelatedTo,
            Self::Duplicates => Self::Duplicates,
        }
    }

    /// Upper-case label used in oracle prompts (e.g. `CAUSED_BY`)
    pub fn label(&self) -> String {
        self.as_str().to_uppercase()
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Evidence supporting a relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipEvidence {
    /// Quoted text (matched span, field value, or oracle quote)
    pub quote: String,
    /// Chunk the quote came from, if known
    pub chunk_ref: Option<String>,
    /// Why the relationship is believed
    pub reasoning: String,
    /// Weight of this piece of evidence (0.0 to 1.0)
    pub weight: f32,
    /// Name of the deterministic rule that produced it
    pub rule: Option<String>,
}

impl RelationshipEvidence {
    /// Evidence from a structured field
    pub fn from_field(field: &str, value: impl Into<String>) -> Self {
        Self {
            quote: value.into(),
            chunk_ref: None,
            reasoning: format!("structured field `{}`", field),
            weight: 1.0,
            rule: Some(format!("field:{}", field)),
        }
    }

    /// Evidence from a text pattern rule
    pub fn from_rule(rule: &str, matched: impl Into<String>, weight: f32) -> Self {
        Self {
            quote: matched.into(),
            chunk_ref: None,
            reasoning: format!("matched text rule `{}`", rule),
            weight: weight.clamp(0.0, 1.0),
            rule: Some(rule.to_string()),
        }
    }

    /// Evidence from an oracle judgment
    pub fn from_judgment(
        reasoning: impl Into<String>,
        quote: impl Into<String>,
        weight: f32,
    ) -> Self {
        Self {
            quote: quote.into(),
            chunk_ref: None,
            reasoning: reasoning.into(),
            weight: weight.clamp(0.0, 1.0),
            rule: None,
        }
    }

    /// Set the chunk reference
    pub fn with_chunk(mut self, chunk_ref: Option<String>) -> Self {
        self.chunk_ref = chunk_ref;
        self
    }

    /// Stable fingerprint used to de-duplicate evidence on re-runs
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.quote.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.chunk_ref.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(self.rule.as_deref().unwrap_or("").as_bytes());
        hex::encode(hasher.finalize())
    }
}
