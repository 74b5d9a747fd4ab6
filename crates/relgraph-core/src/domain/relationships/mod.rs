//! Relationship store, confidence gate and bidirectional builder
//!
//! # Architecture
//!
//! - `relationship`: Typed, evidenced edges and their inverses
//! - `proposal`: Candidate edges produced by extraction and semantic judgment
//! - `gate`: Confidence bands deciding accept, review or discard
//! - `pending`: Accepted edges waiting for their target document
//! - `review`: Review queue items
//! - `builder`: Carries proposals to a terminal state and promotes pending rows
//! - `repository`: Persistence trait with the single guarded write path

pub mod builder;
pub mod gate;
pub mod pending;
pub mod proposal;
pub mod relationship;
pub mod repository;
pub mod review;

pub use builder::{AppliedProposal, BidirectionalBuilder, PromotionReport};
pub use gate::{ConfidenceGate, GateDecision};
pub use pending::{PendingRelationship, PendingStatus};
pub use proposal::{ProposalOutcome, RelationshipProposal, TargetRef, dedup_proposals};
pub use relationship::{
    Endpoint, NodeKind, Relationship, RelationshipEvidence, RelationshipSource,
    RelationshipStatus, RelationshipType,
};
pub use repository::{Direction, PairWrite, RelationshipRepository, RelationshipStats, WriteOutcome};
pub use review::{ReviewItem, ReviewStatus};
