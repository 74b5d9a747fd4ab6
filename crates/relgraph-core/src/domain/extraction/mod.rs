//! Deterministic reference extraction
//!
//! - `fields`: Structured-field rules (author, assignees, linked items, ...)
//! - `patterns`: Versioned text rules over title and body
//! - `extractor`: Combines both into de-duplicated proposals

pub mod extractor;
pub mod fields;
pub mod patterns;

pub use extractor::{ExtractionCounts, ExtractionOutput, ReferenceExtractor};
pub use fields::{FieldReference, FieldTarget, field_references, person_hint, repository_name};
pub use patterns::{EXTRACTION_RULE_VERSION, ExtractionRule, ScanContext, TextMatch, TextRules};
