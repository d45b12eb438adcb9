//! Blob backend trait definition.

use crate::error::{StoreError, StoreResult};

/// A store of opaque byte blobs keyed by file identifier.
///
/// Backends do not interpret the bytes they hold. Sealing and unsealing
/// databases is the job of [`super::EncryptedStore`].
///
/// # Invariants
///
/// - `put` replaces the whole blob atomically: a reader observes either the
///   previous bytes or the new bytes, never a mix
/// - `get` returns exactly the bytes of the last successful `put`
/// - Backends must be `Send + Sync` so one instance can be shared
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - One file per blob in a directory
pub trait BlobBackend: Send + Sync {
    /// Reads the blob stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no blob exists, or an I/O error.
    fn get(&self, id: &str) -> StoreResult<Vec<u8>>;

    /// Atomically replaces the blob stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is invalid or the write fails.
    /// A failed `put` leaves the previous blob in place.
    fn put(&self, id: &str, data: &[u8]) -> StoreResult<()>;

    /// Deletes the blob stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no blob exists.
    fn delete(&self, id: &str) -> StoreResult<()>;

    /// Returns true if a blob exists under `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if existence cannot be determined.
    fn exists(&self, id: &str) -> StoreResult<bool>;

    /// Lists all blob identifiers, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    fn list(&self) -> StoreResult<Vec<String>>;
}

/// Rejects identifiers that could escape a directory or collide with temp files.
pub(crate) fn validate_id(id: &str) -> StoreResult<()> {
    let invalid = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0'])
        || id.ends_with(".tmp");
    if invalid {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}
