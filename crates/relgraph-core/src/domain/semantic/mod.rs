//! Semantic candidate stage
//!
//! - `vector`: Nearest-neighbour lookup seam and an in-memory index
//! - `oracle`: Judgment oracle seam and reply validation
//! - `engine`: Retrieval, judgment and proposal building

pub mod engine;
pub mod oracle;
pub mod vector;

pub use engine::{SemanticCandidateEngine, SemanticOutcome};
pub use oracle::{
    Judgment, JudgmentCandidate, JudgmentDocument, JudgmentOracle, JudgmentRequest,
    ParsedJudgments, parse_judgments,
};
pub use vector::{InMemoryVectorIndex, VectorHit, VectorIndex, cosine_similarity};
