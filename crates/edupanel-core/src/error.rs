//! Error types for edupanel store operations.

use thiserror::Error;

/// Result type alias using edupanel's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type returned by record and attachment stores.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Record not found
    #[error("Record not found: {0}")]
    RecordNotFound(uuid::Uuid),

    /// Uniqueness or foreign-key constraint blocked the operation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Attachment storage backend failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Collaborator call did not answer in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for both the generic and the record-specific not-found variants.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::RecordNotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Error::InvalidInput(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
