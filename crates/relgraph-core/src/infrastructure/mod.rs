//! Infrastructure layer
//!
//! Contains implementations for external systems: the SQLite repositories and the
//! HTTP judgment oracle.

pub mod oracle;
pub mod sqlite;

pub use oracle::HttpJudgmentOracle;
