//! Durable namespaced key/value state.
//!
//! The registry keeps its name → file mapping here and the sync tracker keeps
//! its records here. Every mutation goes through [`StateStore::apply`], which
//! commits a whole [`StateBatch`] or nothing.

use crate::error::{StoreError, StoreResult};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

type Namespaces = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// One mutation inside a [`StateBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateOp {
    /// Insert or replace a value.
    Put {
        /// Namespace.
        namespace: String,
        /// Key within the namespace.
        key: String,
        /// New value.
        value: Vec<u8>,
    },
    /// Remove a value if present.
    Delete {
        /// Namespace.
        namespace: String,
        /// Key within the namespace.
        key: String,
    },
}

/// An ordered group of mutations applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateBatch {
    ops: Vec<StateOp>,
}

impl StateBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a put.
    #[must_use]
    pub fn put(mut self, namespace: &str, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.ops.push(StateOp::Put {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value: value.into(),
        });
        self
    }

    /// Adds a delete.
    #[must_use]
    pub fn delete(mut self, namespace: &str, key: &str) -> Self {
        self.ops.push(StateOp::Delete {
            namespace: namespace.to_string(),
            key: key.to_string(),
        });
        self
    }

    /// Returns the operations in order.
    #[must_use]
    pub fn ops(&self) -> &[StateOp] {
        &self.ops
    }

    /// Returns true if the batch has no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn apply_to(&self, namespaces: &mut Namespaces) {
        for op in &self.ops {
            match op {
                StateOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    namespaces
                        .entry(namespace.clone())
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                StateOp::Delete { namespace, key } => {
                    if let Some(ns) = namespaces.get_mut(namespace) {
                        ns.remove(key);
                        if ns.is_empty() {
                            namespaces.remove(namespace);
                        }
                    }
                }
            }
        }
    }
}

/// Durable key/value state that survives process restart.
pub trait StateStore: Send + Sync {
    /// Reads one value.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Returns every key/value pair of a namespace, sorted by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn scan(&self, namespace: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;

    /// Applies a batch atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be made durable. In that case
    /// none of its operations are visible.
    fn apply(&self, batch: StateBatch) -> StoreResult<()>;

    /// Puts a single value.
    ///
    /// # Errors
    ///
    /// See [`apply`](Self::apply).
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> StoreResult<()> {
        self.apply(StateBatch::new().put(namespace, key, value))
    }

    /// Deletes a single value.
    ///
    /// # Errors
    ///
    /// See [`apply`](Self::apply).
    fn delete(&self, namespace: &str, key: &str) -> StoreResult<()> {
        self.apply(StateBatch::new().delete(namespace, key))
    }
}

/// In-memory state for tests and ephemeral registries.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    namespaces: RwLock<Namespaces>,
    fail_writes: AtomicBool,
}

impl InMemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `apply` fail without changing anything.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    fn scan(&self, namespace: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .map(|ns| ns.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn apply(&self, batch: StateBatch) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                ErrorKind::Other,
                "injected write failure",
            )));
        }
        batch.apply_to(&mut self.namespaces.write());
        Ok(())
    }
}

/// State persisted as a single CBOR document.
///
/// Each `apply` rewrites the document to `<path>.tmp`, syncs it and renames
/// it over `<path>`, so the file on disk always holds a complete state.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    namespaces: RwLock<Namespaces>,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    /// Opens the state file at `path`, starting empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let namespaces = match fs::read(path) {
            Ok(bytes) => ciborium::from_reader(bytes.as_slice())
                .map_err(|e| StoreError::corrupted(format!("state file: {e}")))?,
            Err(e) if e.kind() == ErrorKind::NotFound => Namespaces::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "opened state file");

        Ok(Self {
            path: path.to_path_buf(),
            namespaces: RwLock::new(namespaces),
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the path of the state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, namespaces: &Namespaces) -> StoreResult<()> {
        let mut bytes = Vec::new();
        ciborium::into_writer(namespaces, &mut bytes)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        let result = (|| -> StoreResult<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&temp, &self.path)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result
    }
}

impl StateStore for FileStateStore {
    fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    fn scan(&self, namespace: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .map(|ns| ns.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn apply(&self, batch: StateBatch) -> StoreResult<()> {
        let _guard = self.write_lock.lock();

        let mut next = self.namespaces.read().clone();
        batch.apply_to(&mut next);
        self.persist(&next)?;

        *self.namespaces.write() = next;
        Ok(())
    }
}
