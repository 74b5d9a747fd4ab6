//! Domain layer
//!
//! Contains the relationship-graph models, the traits the storage layer implements, and
//! the services that drive a document from ingestion to graph edges.

pub mod audit;
pub mod backfill;
pub mod documents;
pub mod extraction;
pub mod graph;
pub mod identity;
pub mod relationships;
pub mod semantic;
