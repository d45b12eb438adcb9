//! CLI command implementations.

pub mod databases;
pub mod entries;
pub mod membership;
pub mod sync;

use safesync_core::{DatabaseRegistry, RegistryConfig};
use safesync_storage::{EncryptedStore, FileBackend, FileStateStore, Passphrase};
use safesync_sync::MembershipTracker;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the registry state file inside the documents directory.
pub const STATE_FILE: &str = ".safesync-state.cbor";

/// Registry and tracker over one documents directory.
pub struct Session {
    /// Documents directory.
    pub dir: PathBuf,
    /// Database registry.
    pub registry: Arc<DatabaseRegistry>,
    /// Sync membership.
    pub tracker: Arc<MembershipTracker>,
}

impl Session {
    /// Opens the registry stored in `dir`, creating the directory if needed.
    pub fn open(dir: &Path) -> Result<Self, Box<dyn Error>> {
        let store = EncryptedStore::new(FileBackend::open(dir)?);
        let state = FileStateStore::open(&dir.join(STATE_FILE))?;
        let registry = Arc::new(DatabaseRegistry::new(
            Arc::new(store),
            Arc::new(state),
            RegistryConfig::default(),
        )?);
        let tracker = Arc::new(MembershipTracker::new(Arc::clone(&registry))?);

        Ok(Self {
            dir: dir.to_path_buf(),
            registry,
            tracker,
        })
    }
}

/// Returns the passphrase given on the command line or in the environment.
pub fn passphrase(value: Option<&str>) -> Result<Passphrase, Box<dyn Error>> {
    match value {
        Some(p) if !p.is_empty() => Ok(Passphrase::new(p)),
        _ => Err("Passphrase required (--passphrase or SAFESYNC_PASSPHRASE)".into()),
    }
}
