//! SQLite implementations of the domain repositories
//!
//! Timestamps are stored as RFC 3339 text with fixed microsecond precision so that
//! string comparison orders them correctly. JSON columns hold serde_json text.

mod audit;
mod documents;
mod identity;
mod relationships;

pub use audit::SqliteAuditRepository;
pub use documents::SqliteDocumentRepository;
pub use identity::SqliteIdentityRepository;
pub use relationships::SqliteRelationshipRepository;

pub(crate) use audit::insert_audit;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

pub(crate) fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Other(format!("Failed to serialize {}: {}", what, e)))
}

pub(crate) fn from_json<T: DeserializeOwned + Default>(value: &str) -> T {
    serde_json::from_str(value).unwrap_or_default()
}
