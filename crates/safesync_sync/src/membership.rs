//! Which databases are mirrored to the remote, and what the remote looked
//! like at their last successful sync.

use crate::error::{SyncError, SyncResult};
use crate::remote::Revision;
use parking_lot::Mutex;
use safesync_core::{DatabaseRegistry, ListenerId, RegistryEvent};
use safesync_storage::{StateBatch, StateStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State store namespace holding sync records.
pub const SYNC_NAMESPACE: &str = "sync";

/// Persisted sync state of one marked database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Remote revision at the last successful sync.
    pub revision: Option<Revision>,
    /// Local edits were committed since the last successful sync.
    pub locally_modified: bool,
}

/// Persisted records, shared with the feed listener.
struct SyncRecords {
    state: Arc<dyn StateStore>,
    // Serializes read-modify-write cycles on a record.
    lock: Mutex<()>,
}

impl SyncRecords {
    fn get(&self, name: &str) -> SyncResult<Option<SyncRecord>> {
        match self.state.get(SYNC_NAMESPACE, name)? {
            Some(bytes) => ciborium::from_reader(bytes.as_slice())
                .map(Some)
                .map_err(|e| {
                    SyncError::Storage(safesync_storage::StoreError::corrupted(format!(
                        "sync record for {name:?}: {e}"
                    )))
                }),
            None => Ok(None),
        }
    }

    fn encode(record: &SyncRecord) -> SyncResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(record, &mut bytes).map_err(|e| {
            SyncError::Storage(safesync_storage::StoreError::Serialization(e.to_string()))
        })?;
        Ok(bytes)
    }

    fn put(&self, name: &str, record: &SyncRecord) -> SyncResult<()> {
        let bytes = Self::encode(record)?;
        self.state.put(SYNC_NAMESPACE, name, &bytes)?;
        Ok(())
    }

    fn apply_event(&self, event: &RegistryEvent) -> SyncResult<()> {
        let _guard = self.lock.lock();
        match event {
            RegistryEvent::Removed { name } => {
                if self.get(name)?.is_some() {
                    self.state.delete(SYNC_NAMESPACE, name)?;
                    debug!(name = %name, "sync record dropped with database");
                }
            }
            RegistryEvent::Renamed { old, new } => {
                if let Some(record) = self.get(old)? {
                    let batch = StateBatch::new()
                        .delete(SYNC_NAMESPACE, old)
                        .put(SYNC_NAMESPACE, new, Self::encode(&record)?);
                    self.state.apply(batch)?;
                    debug!(old = %old, new = %new, "sync record moved");
                }
            }
            RegistryEvent::Changed { name } => {
                if let Some(mut record) = self.get(name)? {
                    if !record.locally_modified {
                        record.locally_modified = true;
                        self.put(name, &record)?;
                        debug!(name = %name, "local edit recorded");
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Tracks which registered databases are marked for sync.
///
/// The tracker listens on the registry's event feed and updates its records
/// as each event is emitted: removing a database drops its record, renaming
/// moves it, and a committed edit sets [`SyncRecord::locally_modified`]
/// before the edit call returns.
pub struct MembershipTracker {
    registry: Arc<DatabaseRegistry>,
    records: Arc<SyncRecords>,
    listener: ListenerId,
}

impl MembershipTracker {
    /// Creates a tracker over the registry's state store.
    ///
    /// Records left behind for names that are no longer registered are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted records cannot be read.
    pub fn new(registry: Arc<DatabaseRegistry>) -> SyncResult<Self> {
        let records = Arc::new(SyncRecords {
            state: registry.state_store(),
            lock: Mutex::new(()),
        });

        let listening = Arc::clone(&records);
        let listener = registry.events().listen(move |event| {
            if let Err(e) = listening.apply_event(event) {
                warn!(?event, error = %e, "failed to apply registry event to sync records");
            }
        });

        let tracker = Self {
            registry,
            records,
            listener,
        };
        tracker.drop_stale()?;
        Ok(tracker)
    }

    fn drop_stale(&self) -> SyncResult<()> {
        let _guard = self.records.lock.lock();
        let mut stale = StateBatch::new();
        for (name, _) in self.records.state.scan(SYNC_NAMESPACE)? {
            if !self.registry.contains(&name) {
                warn!(name = %name, "dropping sync record of unregistered database");
                stale = stale.delete(SYNC_NAMESPACE, &name);
            }
        }
        if !stale.is_empty() {
            self.records.state.apply(stale)?;
        }
        Ok(())
    }

    /// Marks a registered database for sync.
    ///
    /// Returns false if the name is unknown or already marked. A freshly
    /// marked database counts as locally modified until its first sync, so
    /// an existing remote copy is never adopted over local entries silently.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted.
    pub fn mark(&self, name: &str) -> SyncResult<bool> {
        if !self.registry.contains(name) {
            return Ok(false);
        }
        let _guard = self.records.lock.lock();
        if self.records.get(name)?.is_some() {
            return Ok(false);
        }

        let record = SyncRecord {
            revision: None,
            locally_modified: true,
        };
        self.records.put(name, &record)?;
        info!(name, "marked for sync");
        Ok(true)
    }

    /// Stops syncing a database. Local and remote data are untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be deleted.
    pub fn unmark(&self, name: &str) -> SyncResult<bool> {
        let _guard = self.records.lock.lock();
        if self.records.get(name)?.is_none() {
            return Ok(false);
        }
        self.records.state.delete(SYNC_NAMESPACE, name)?;
        info!(name, "unmarked for sync");
        Ok(true)
    }

    /// Returns true if the database is marked.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn is_marked(&self, name: &str) -> SyncResult<bool> {
        Ok(self.records.get(name)?.is_some())
    }

    /// Returns all marked names, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read.
    pub fn marked_names(&self) -> SyncResult<Vec<String>> {
        Ok(self
            .records
            .state
            .scan(SYNC_NAMESPACE)?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    /// Returns the last known remote revision.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn revision_for(&self, name: &str) -> SyncResult<Option<Revision>> {
        Ok(self.records.get(name)?.and_then(|r| r.revision))
    }

    /// Sets the last known remote revision. Returns false if not marked.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted.
    pub fn set_revision(&self, name: &str, revision: Revision) -> SyncResult<bool> {
        let _guard = self.records.lock.lock();
        let Some(mut record) = self.records.get(name)? else {
            return Ok(false);
        };
        record.revision = Some(revision);
        self.records.put(name, &record)?;
        Ok(true)
    }

    /// Returns true if edits were committed since the last sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn is_locally_modified(&self, name: &str) -> SyncResult<bool> {
        Ok(self.records.get(name)?.is_some_and(|r| r.locally_modified))
    }

    /// Records a completed sync: sets the revision and clears the modified flag.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotMarked`] if the database is not marked.
    pub fn record_synced(&self, name: &str, revision: &Revision) -> SyncResult<()> {
        let _guard = self.records.lock.lock();
        if self.records.get(name)?.is_none() {
            return Err(SyncError::NotMarked {
                name: name.to_string(),
            });
        }
        let record = SyncRecord {
            revision: Some(revision.clone()),
            locally_modified: false,
        };
        self.records.put(name, &record)?;
        debug!(name, revision = %revision, "sync recorded");
        Ok(())
    }

    /// Returns the full record of a database.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or decoded.
    pub fn get(&self, name: &str) -> SyncResult<Option<SyncRecord>> {
        self.records.get(name)
    }
}

impl Drop for MembershipTracker {
    fn drop(&mut self) {
        self.registry.events().unlisten(self.listener);
    }
}

impl std::fmt::Debug for MembershipTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipTracker").finish_non_exhaustive()
    }
}
