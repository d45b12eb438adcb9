//! In-memory blob backend for testing.

use crate::backend::{validate_id, BlobBackend};
use crate::error::{StoreError, StoreResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// An in-memory blob backend.
///
/// This backend keeps every blob in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral registries that don't need persistence
///
/// Writes can be made to fail on demand with [`fail_writes`](Self::fail_writes),
/// which lets callers test that a failed write leaves no trace.
///
/// # Example
///
/// ```rust
/// use safesync_storage::{BlobBackend, InMemoryBackend};
///
/// let backend = InMemoryBackend::new();
/// backend.put("a.psafe3", b"sealed").unwrap();
/// assert_eq!(backend.get("a.psafe3").unwrap(), b"sealed");
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `put`, `delete` fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Returns true if no blobs are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        Ok(())
    }
}

impl BlobBackend for InMemoryBackend {
    fn get(&self, id: &str) -> StoreResult<Vec<u8>> {
        self.blobs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(id))
    }

    fn put(&self, id: &str, data: &[u8]) -> StoreResult<()> {
        validate_id(id)?;
        self.check_writable()?;
        self.blobs.write().insert(id.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, id: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.blobs
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(id))
    }

    fn exists(&self, id: &str) -> StoreResult<bool> {
        Ok(self.blobs.read().contains_key(id))
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        Ok(self.blobs.read().keys().cloned().collect())
    }
}
