//! Entity and identity resolution
//!
//! # Architecture
//!
//! - `entity`: Entities, aliases and identity hints
//! - `strategy`: The ordered resolution strategy list and heuristic scoring
//! - `resolver`: `resolve(workspace, hint) -> entity id`
//! - `merge`: Merge suggestions and admin operation results
//! - `repository`: Persistence trait

pub mod entity;
pub mod merge;
pub mod repository;
pub mod resolver;
pub mod strategy;

pub use entity::{AliasType, Entity, EntityAlias, EntityKind, IdentityHint};
pub use merge::{MergeResult, MergeSuggestion, SplitResult, SuggestionStatus};
pub use repository::IdentityRepository;
pub use resolver::{EntityResolver, Resolution};
pub use strategy::{DEFAULT_STRATEGIES, HeuristicScore, ResolutionStrategy};
