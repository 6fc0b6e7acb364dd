use thiserror::Error;

use crate::object_store::ObjectStoreError;
use crate::storage::DatabaseError;

/// Errors surfaced by ingest and the file operations built on it.
#[derive(Debug, Error)]
pub enum FileError {
    /// Malformed input, rejected before any I/O.
    #[error("Invalid input: {0}")]
    Validation(String),
    /// Missing record, or one the caller does not own.
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Storage error: {0}")]
    Storage(#[from] ObjectStoreError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl FileError {
    pub fn validation(message: impl Into<String>) -> Self {
        FileError::Validation(message.into())
    }
}
