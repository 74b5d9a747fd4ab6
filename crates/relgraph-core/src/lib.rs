//! Relgraph Core Library
//!
//! This crate provides the core functionality for Relgraph, including:
//! - Document registry and extraction state (SQLite)
//! - Entity resolution with audited merge and split
//! - Deterministic reference extraction
//! - Semantic candidate retrieval and oracle judgment
//! - Confidence gating, pending promotion and the review queue
//! - Bidirectional relationship writes
//! - Backfill over historical documents
//! - Adjacency cache for neighbourhood queries and retrieval boosting

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod pipeline;
pub mod retry;
pub mod storage;

pub use error::{Error, Result};
pub use pipeline::RelationshipPipeline;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::backfill::{BackfillReason, BackfillTrigger};
    pub use crate::domain::documents::{Document, ProcessingReport};
    pub use crate::domain::relationships::{Direction, Relationship, RelationshipType};
    pub use crate::error::{Error, Result};
    pub use crate::pipeline::RelationshipPipeline;
}
