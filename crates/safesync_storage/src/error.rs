//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No blob exists under the given identifier.
    #[error("no such file: {id}")]
    NotFound {
        /// The missing identifier.
        id: String,
    },

    /// The passphrase does not unlock the database.
    #[error("wrong passphrase")]
    WrongPassphrase,

    /// The stored bytes are not a readable database.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Encryption or key derivation failed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Encoding or decoding of a record failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The identifier cannot be used as a blob name.
    #[error("invalid file identifier: {0:?}")]
    InvalidId(String),
}

impl StoreError {
    /// Creates a not-found error for the given identifier.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Returns true if this error means the blob does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}
