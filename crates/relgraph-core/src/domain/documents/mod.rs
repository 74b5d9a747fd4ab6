//! Document registry
//!
//! Documents are the primary nodes of the graph. The registry maps natural keys to
//! internal ids and tracks the last extraction pass over each document.

pub mod document;
pub mod processing;
pub mod repository;

pub use document::{
    ChunkRef, Document, DocumentKey, ExtractionState, SemanticStatus, StoredDocument,
};
pub use processing::ProcessingReport;
pub use repository::{BackfillSelection, DocumentRepository, RegisterOutcome};
