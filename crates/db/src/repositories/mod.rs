use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use tollgate_core::audit::AuditError;
use tollgate_core::memory::MemoryError;
use tollgate_core::store::StoreError;

pub mod audit;
pub mod conversation;
pub mod memory;

pub use audit::SqlAuditSink;
pub use conversation::SqlConversationStore;
pub use memory::SqlMemoryStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

impl From<RepositoryError> for MemoryError {
    fn from(value: RepositoryError) -> Self {
        MemoryError::Backend(value.to_string())
    }
}

impl From<RepositoryError> for AuditError {
    fn from(value: RepositoryError) -> Self {
        AuditError::Write(value.to_string())
    }
}

impl From<RepositoryError> for StoreError {
    fn from(value: RepositoryError) -> Self {
        StoreError::Backend(value.to_string())
    }
}

/// Fixed-width RFC 3339 so that text ordering in SQL matches time ordering.
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("invalid timestamp in `{column}`: {e}")))
}
