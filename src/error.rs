//! Error taxonomy shared by the sync engine and the query surface.
//!
//! Each variant maps to a recovery policy: configuration errors are fatal at
//! startup, source and persistence errors abort only the unit being processed
//! (row, table, or source), and the request-facing variants translate to HTTP
//! status codes in [`crate::server`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("schema unavailable for table '{table}': {message}")]
    SchemaUnavailable { table: String, message: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("embedding capability unavailable: {0}")]
    EmbeddingUnavailable(String),
}

impl SyncError {
    /// Machine-readable code used in HTTP error bodies and log fields.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Configuration(_) => "configuration",
            SyncError::SourceUnavailable(_) => "source_unavailable",
            SyncError::SchemaUnavailable { .. } => "schema_unavailable",
            SyncError::Persistence(_) => "internal",
            SyncError::AccessDenied(_) => "access_denied",
            SyncError::Validation(_) => "bad_request",
            SyncError::NotFound(_) => "not_found",
            SyncError::Embedding(_) => "embedding_failed",
            SyncError::EmbeddingUnavailable(_) => "embedding_unavailable",
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Persistence(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::SourceUnavailable(e.to_string())
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
