//! Remote object store abstraction.
//!
//! The remote keeps one opaque blob per remote name and hands out a new
//! revision token on every upload. Tokens are only ever compared for
//! equality.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

/// Opaque version marker returned by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision(String);

impl Revision {
    /// Wraps a revision token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors reported by a remote store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport failure.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the call may succeed if repeated.
        retryable: bool,
    },

    /// No object exists under the name.
    #[error("remote file not found: {name}")]
    NotFound {
        /// Remote name.
        name: String,
    },
}

impl RemoteError {
    /// Creates a retryable network error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }
}

/// A revisioned remote object store.
///
/// Implementations only move bytes; they never inspect database contents.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Returns the current revision of `name`, or `None` if it does not exist.
    async fn get_revision(&self, name: &str) -> Result<Option<Revision>, RemoteError>;

    /// Downloads `name` together with the revision of the returned bytes.
    async fn download(&self, name: &str) -> Result<(Vec<u8>, Revision), RemoteError>;

    /// Replaces `name` with `bytes` and returns the new revision.
    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<Revision, RemoteError>;
}

/// Calls made against a [`MemoryRemoteStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCallCounts {
    /// `get_revision` calls.
    pub revision_checks: u64,
    /// Successful downloads.
    pub downloads: u64,
    /// Successful uploads.
    pub uploads: u64,
}

/// Holds downloads of a [`MemoryRemoteStore`] until released.
#[derive(Debug, Clone, Default)]
pub struct DownloadGate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl DownloadGate {
    /// Waits until a download is blocked on the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Lets one blocked download continue.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// In-memory remote store with fault injection, for tests.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    files: Mutex<HashMap<String, (Vec<u8>, Revision)>>,
    next_revision: AtomicU64,
    failures: Mutex<VecDeque<RemoteError>>,
    upload_failures: Mutex<VecDeque<RemoteError>>,
    gate: Mutex<Option<DownloadGate>>,
    calls: Mutex<RemoteCallCounts>,
}

impl MemoryRemoteStore {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `bytes` as if another device had uploaded them.
    pub fn put(&self, name: &str, bytes: Vec<u8>) -> Revision {
        let revision = self.bump();
        self.files
            .lock()
            .insert(name.to_string(), (bytes, revision.clone()));
        revision
    }

    /// Deletes `name`.
    pub fn delete(&self, name: &str) {
        self.files.lock().remove(name);
    }

    /// Returns the stored bytes and revision of `name`.
    pub fn get(&self, name: &str) -> Option<(Vec<u8>, Revision)> {
        self.files.lock().get(name).cloned()
    }

    /// Makes the next call of any kind fail with `error`.
    pub fn fail_next(&self, error: RemoteError) {
        self.failures.lock().push_back(error);
    }

    /// Makes the next `count` uploads fail with `error`.
    pub fn fail_uploads(&self, count: usize, error: RemoteError) {
        let mut failures = self.upload_failures.lock();
        for _ in 0..count {
            failures.push_back(error.clone());
        }
    }

    /// Installs a gate that blocks every download until released.
    pub fn hold_downloads(&self) -> DownloadGate {
        let gate = DownloadGate::default();
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    /// Removes the download gate.
    pub fn open_downloads(&self) {
        *self.gate.lock() = None;
    }

    /// Returns the number of calls made so far.
    pub fn calls(&self) -> RemoteCallCounts {
        *self.calls.lock()
    }

    fn bump(&self) -> Revision {
        let n = self.next_revision.fetch_add(1, Ordering::SeqCst) + 1;
        Revision::new(format!("r{n}"))
    }

    fn injected(&self) -> Result<(), RemoteError> {
        match self.failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get_revision(&self, name: &str) -> Result<Option<Revision>, RemoteError> {
        self.calls.lock().revision_checks += 1;
        self.injected()?;
        Ok(self.files.lock().get(name).map(|(_, rev)| rev.clone()))
    }

    async fn download(&self, name: &str) -> Result<(Vec<u8>, Revision), RemoteError> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.injected()?;

        let file = self
            .files
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound {
                name: name.to_string(),
            })?;
        self.calls.lock().downloads += 1;
        Ok(file)
    }

    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<Revision, RemoteError> {
        self.injected()?;
        if let Some(error) = self.upload_failures.lock().pop_front() {
            return Err(error);
        }

        let revision = self.put(name, bytes.to_vec());
        self.calls.lock().uploads += 1;
        Ok(revision)
    }
}

/// Remote store backed by a directory.
///
/// Each remote object is a file `<name>` with a sibling `<name>.rev` holding
/// a decimal counter that is bumped on every upload.
#[derive(Debug)]
pub struct DirRemoteStore {
    root: PathBuf,
}

impl DirRemoteStore {
    /// Opens a remote rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Returns the directory holding remote objects.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn paths(&self, name: &str) -> Result<(PathBuf, PathBuf), RemoteError> {
        if name.is_empty() || name.contains(['/', '\\', '\0']) || name == "." || name == ".." {
            return Err(RemoteError::fatal(format!("invalid remote name {name:?}")));
        }
        Ok((
            self.root.join(name),
            self.root.join(format!("{name}.rev")),
        ))
    }

    async fn read_counter(path: &Path) -> Result<Option<u64>, RemoteError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => text
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| RemoteError::fatal(format!("bad revision file {}", path.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn replace(path: &Path, bytes: &[u8]) -> Result<(), RemoteError> {
        let mut temp = path.as_os_str().to_owned();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        tokio::fs::write(&temp, bytes).await.map_err(io_error)?;
        tokio::fs::rename(&temp, path).await.map_err(io_error)
    }
}

#[async_trait]
impl RemoteStore for DirRemoteStore {
    async fn get_revision(&self, name: &str) -> Result<Option<Revision>, RemoteError> {
        let (data, rev) = self.paths(name)?;
        if !tokio::fs::try_exists(&data).await.map_err(io_error)? {
            return Ok(None);
        }
        let counter = Self::read_counter(&rev).await?.unwrap_or(0);
        Ok(Some(Revision::new(counter.to_string())))
    }

    async fn download(&self, name: &str) -> Result<(Vec<u8>, Revision), RemoteError> {
        let (data, rev) = self.paths(name)?;
        let counter = Self::read_counter(&rev).await?.unwrap_or(0);
        let bytes = match tokio::fs::read(&data).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RemoteError::NotFound {
                    name: name.to_string(),
                })
            }
            Err(e) => return Err(io_error(e)),
        };
        Ok((bytes, Revision::new(counter.to_string())))
    }

    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<Revision, RemoteError> {
        let (data, rev) = self.paths(name)?;
        let next = Self::read_counter(&rev).await?.unwrap_or(0) + 1;

        Self::replace(&data, bytes).await?;
        Self::replace(&rev, next.to_string().as_bytes()).await?;
        debug!(name, revision = next, "uploaded to directory remote");
        Ok(Revision::new(next.to_string()))
    }
}

fn io_error(e: std::io::Error) -> RemoteError {
    let retryable = matches!(
        e.kind(),
        ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock
    );
    RemoteError::Network {
        message: e.to_string(),
        retryable,
    }
}
