//! Read-optimized graph projection and retrieval boosting

pub mod adjacency;
pub mod boost;

pub use adjacency::{AdjacencyCache, MAX_HOPS, Neighbor};
pub use boost::{BoostedCandidate, GraphBooster, ScoredCandidate};
