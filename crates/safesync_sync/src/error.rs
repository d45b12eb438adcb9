//! Error types for sync and conflict resolution.

use crate::remote::RemoteError;
use safesync_core::CoreError;
use safesync_storage::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while syncing or resolving a conflict.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote store could not be reached or rejected the request.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The downloaded remote copy cannot be opened with the local passphrase.
    #[error("remote copy cannot be decrypted: {message}")]
    DecryptFailed {
        /// Description of the failure.
        message: String,
    },

    /// A merge was requested while some entry conflicts have no choice.
    #[error("merge incomplete: {} unresolved entries", unresolved.len())]
    MergeIncomplete {
        /// Display form of the keys still in conflict.
        unresolved: Vec<String>,
    },

    /// A merge plan was computed from other entries than the pending
    /// conflict's local and remote copies.
    #[error("merge plan for {name:?} does not match the pending conflict")]
    PlanMismatch {
        /// Friendly name.
        name: String,
    },

    /// Another sync, resolution or edit holds the database.
    #[error("database {name:?} is busy")]
    Busy {
        /// Friendly name.
        name: String,
    },

    /// The database is not marked for sync.
    #[error("database {name:?} is not marked for sync")]
    NotMarked {
        /// Friendly name.
        name: String,
    },

    /// The operation was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// No database is registered under the name.
    #[error("no database named {name:?}")]
    UnknownName {
        /// Friendly name.
        name: String,
    },

    /// The database must be open to sync.
    #[error("database {name:?} is not open")]
    NotOpen {
        /// Friendly name.
        name: String,
    },

    /// Registry or model error.
    #[error("database error: {0}")]
    Core(#[source] CoreError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl SyncError {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network { retryable: true, .. })
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Busy { name } => SyncError::Busy { name },
            CoreError::UnknownName { name } => SyncError::UnknownName { name },
            CoreError::NotOpen { name } => SyncError::NotOpen { name },
            CoreError::Storage(e) => SyncError::Storage(e),
            other => SyncError::Core(other),
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Network { message, retryable } => SyncError::Network { message, retryable },
            RemoteError::NotFound { name } => {
                SyncError::network_fatal(format!("remote file {name:?} not found"))
            }
        }
    }
}
