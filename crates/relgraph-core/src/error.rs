//! Error types for Relgraph

use thiserror::Error;

/// Result type alias using Relgraph's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Relgraph error types
///
/// The taxonomy mirrors how the pipeline reacts to a failure: validation errors are
/// skipped, transient dependency errors are retried with backoff, conflicts are
/// absorbed by re-reading, schema violations are discarded and counted, and fatal
/// errors halt only the affected batch.
#[derive(Error, Debug)]
pub enum Error {
    // Lookup errors (E001-E099)
    #[error("Document '{0}' not found.")]
    DocumentNotFound(String),

    #[error("Entity '{0}' not found. Run `relgraph entities list` to see known entities.")]
    EntityNotFound(String),

    #[error("Alias '{0}' not found.")]
    AliasNotFound(String),

    #[error("Review item '{0}' not found. Run `relgraph review list` to see open items.")]
    ReviewItemNotFound(String),

    // Input errors (E100-E199)
    #[error("Invalid input: {0}")]
    Validation(String),

    // Dependency errors (E200-E299)
    #[error("Dependency '{dependency}' unavailable: {message}")]
    TransientDependency { dependency: String, message: String },

    #[error("Dependency '{0}' timed out after {1} ms")]
    Timeout(String, u64),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    // Store errors (E300-E399)
    #[error("Conflict on {0}; re-read required")]
    Conflict(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    // Oracle errors (E400-E499)
    #[error("Oracle output violates schema: {0}")]
    SchemaViolation(String),

    // Config and programming errors (E500-E599)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a transient dependency error
    pub fn transient(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientDependency {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::DocumentNotFound(_) => "E001",
            Self::EntityNotFound(_) => "E002",
            Self::AliasNotFound(_) => "E003",
            Self::ReviewItemNotFound(_) => "E004",
            Self::Validation(_) => "E100",
            Self::TransientDependency { .. } => "E200",
            Self::Timeout(..) => "E201",
            Self::NetworkError(_) => "E202",
            Self::Conflict(_) => "E300",
            Self::DatabaseError(_) => "E301",
            Self::SchemaViolation(_) => "E400",
            Self::ConfigError(_) => "E500",
            Self::Fatal(_) => "E501",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Whether the failed operation may succeed if attempted again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientDependency { .. } | Self::Timeout(..) | Self::Conflict(_) => true,
            Self::NetworkError(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            Self::DatabaseError(e) => is_busy(e),
            _ => false,
        }
    }

    /// Whether the error is a malformed-input error that should be skipped
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::SchemaViolation(_))
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::EntityNotFound(_) => Some("relgraph entities list".to_string()),
            Self::ReviewItemNotFound(_) => Some("relgraph review list".to_string()),
            Self::ConfigError(_) => Some("relgraph config list".to_string()),
            Self::TransientDependency { .. } | Self::Timeout(..) => {
                Some("relgraph backfill --reason manual".to_string())
            }
            _ => None,
        }
    }
}

/// Whether a sqlx error is a unique-constraint violation
pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

fn is_busy(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            let message = db.message().to_lowercase();
            message.contains("database is locked") || message.contains("busy")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}
