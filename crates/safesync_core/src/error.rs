//! Error types for SafeSync core.

use safesync_storage::StoreError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in registry and model operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The friendly name is already registered.
    #[error("a database named {name:?} already exists")]
    NameExists {
        /// The conflicting name.
        name: String,
    },

    /// The backing file is already mapped or already exists in the store.
    #[error("backing file {file_id:?} already exists")]
    FileExists {
        /// The conflicting file identifier.
        file_id: String,
    },

    /// No database is registered under the name.
    #[error("no database named {name:?}")]
    UnknownName {
        /// The unknown name.
        name: String,
    },

    /// The passphrase does not unlock the database.
    #[error("wrong passphrase")]
    WrongPassphrase,

    /// The backing file is missing or unreadable.
    #[error("corrupt database file: {message}")]
    CorruptFile {
        /// Description of the problem.
        message: String,
    },

    /// The new database could not be created.
    #[error("failed to create database: {message}")]
    CreateFailed {
        /// Description of the failure.
        message: String,
    },

    /// The database is registered but not open.
    #[error("database {name:?} is not open")]
    NotOpen {
        /// The database name.
        name: String,
    },

    /// A sync or conflict resolution holds the database.
    #[error("database {name:?} is busy")]
    Busy {
        /// The database name.
        name: String,
    },

    /// The model handle was closed.
    #[error("database is closed")]
    Closed,

    /// The friendly name or file identifier is not usable.
    #[error("invalid name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// No entry matches the key.
    #[error("entry not found: {key}")]
    EntryNotFound {
        /// Display form of the entry key.
        key: String,
    },

    /// Storage error not covered by a dedicated variant.
    #[error("storage error: {0}")]
    Storage(#[source] StoreError),
}

impl CoreError {
    /// Creates a name-exists error.
    pub fn name_exists(name: impl Into<String>) -> Self {
        Self::NameExists { name: name.into() }
    }

    /// Creates a file-exists error.
    pub fn file_exists(file_id: impl Into<String>) -> Self {
        Self::FileExists {
            file_id: file_id.into(),
        }
    }

    /// Creates an unknown-name error.
    pub fn unknown_name(name: impl Into<String>) -> Self {
        Self::UnknownName { name: name.into() }
    }

    /// Creates a not-open error.
    pub fn not_open(name: impl Into<String>) -> Self {
        Self::NotOpen { name: name.into() }
    }

    /// Creates a busy error.
    pub fn busy(name: impl Into<String>) -> Self {
        Self::Busy { name: name.into() }
    }

    /// Creates an invalid-name error.
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a create-failed error.
    pub fn create_failed(message: impl Into<String>) -> Self {
        Self::CreateFailed {
            message: message.into(),
        }
    }

    /// Creates a corrupt-file error.
    pub fn corrupt_file(message: impl Into<String>) -> Self {
        Self::CorruptFile {
            message: message.into(),
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WrongPassphrase => CoreError::WrongPassphrase,
            StoreError::Corrupted(message) => CoreError::CorruptFile { message },
            other => CoreError::Storage(other),
        }
    }
}
