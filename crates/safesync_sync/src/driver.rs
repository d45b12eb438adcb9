//! Remote sync state machine.

use crate::cancel::{guarded, pause, CancelSignal};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::membership::MembershipTracker;
use crate::remote::{RemoteStore, Revision};
use crate::resolver::ConflictResolver;
use parking_lot::RwLock;
use safesync_core::{CoreError, DatabaseRegistry, ModelLease, RegistryEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where a database's sync currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No sync of the database has run yet.
    Idle,
    /// Asking the remote for its current revision.
    CheckingRemote,
    /// Fetching the remote copy.
    Downloading,
    /// Deciding what to do from revisions and local edits.
    ComparingRevisions,
    /// Only local edits exist; an upload follows.
    NoConflictUpload,
    /// Both sides already agree.
    NoConflictNone,
    /// Both sides changed; waiting for a resolution.
    Conflicting,
    /// Sending the local copy.
    Uploading,
    /// The last sync finished.
    Done,
    /// The last sync failed.
    Failed,
}

impl SyncState {
    /// Returns true while a remote call may be in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::CheckingRemote
                | SyncState::Downloading
                | SyncState::ComparingRevisions
                | SyncState::NoConflictUpload
                | SyncState::Uploading
        )
    }

    /// Returns true if the last sync reached a final state.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            SyncState::Done | SyncState::Failed | SyncState::NoConflictNone
        )
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Sync cycles that reached `Done`.
    pub cycles_completed: u64,
    /// Successful uploads.
    pub uploads: u64,
    /// Successful downloads.
    pub downloads: u64,
    /// Conflicts detected.
    pub conflicts_detected: u64,
    /// Upload retries.
    pub retries: u64,
    /// Time of the last completed sync.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// What a sync did.
pub enum SyncOutcome {
    /// Remote and local already agreed; nothing was transferred.
    UpToDate,
    /// Local edits were uploaded.
    Uploaded {
        /// Revision returned by the remote.
        revision: Revision,
    },
    /// The remote copy replaced the local contents.
    Adopted {
        /// Revision of the adopted copy.
        revision: Revision,
    },
    /// Both sides changed. The resolver holds the database until consumed
    /// or dropped.
    Conflict(ConflictResolver),
}

impl SyncOutcome {
    /// Returns the conflict resolver, if any.
    pub fn into_conflict(self) -> Option<ConflictResolver> {
        match self {
            SyncOutcome::Conflict(resolver) => Some(resolver),
            _ => None,
        }
    }

    /// Returns true if the sync ended in a conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncOutcome::Conflict(_))
    }
}

impl std::fmt::Debug for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOutcome::UpToDate => f.write_str("UpToDate"),
            SyncOutcome::Uploaded { revision } => {
                f.debug_struct("Uploaded").field("revision", revision).finish()
            }
            SyncOutcome::Adopted { revision } => {
                f.debug_struct("Adopted").field("revision", revision).finish()
            }
            SyncOutcome::Conflict(resolver) => f.debug_tuple("Conflict").field(resolver).finish(),
        }
    }
}

/// State shared by the driver and the resolvers it hands out.
pub(crate) struct SyncShared {
    pub(crate) registry: Arc<DatabaseRegistry>,
    pub(crate) tracker: Arc<MembershipTracker>,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) config: SyncConfig,
    states: RwLock<HashMap<String, SyncState>>,
    stats: RwLock<SyncStats>,
}

impl SyncShared {
    pub(crate) fn set_state(&self, name: &str, state: SyncState) {
        let previous = self.states.write().insert(name.to_string(), state);
        if previous != Some(state) {
            debug!(name, from = ?previous, to = ?state, "sync state");
        }
    }

    fn state(&self, name: &str) -> SyncState {
        self.states
            .read()
            .get(name)
            .copied()
            .unwrap_or(SyncState::Idle)
    }

    pub(crate) fn fail(&self, name: &str, error: &SyncError) {
        // A rejected second sync must not overwrite the one holding the lease.
        if !matches!(error, SyncError::Busy { .. }) {
            self.set_state(name, SyncState::Failed);
        }
        self.stats.write().last_error = Some(error.to_string());
        warn!(name, error = %error, "sync failed");
    }

    /// Commits a finished sync: records the revision and announces it.
    pub(crate) fn complete(&self, name: &str, revision: &Revision) -> SyncResult<()> {
        self.tracker.record_synced(name, revision)?;
        {
            let mut stats = self.stats.write();
            stats.cycles_completed += 1;
            stats.last_sync_time = Some(Instant::now());
            stats.last_error = None;
        }
        self.set_state(name, SyncState::Done);
        self.registry.events().emit(RegistryEvent::SyncCompleted {
            name: name.to_string(),
            revision: revision.to_string(),
        });
        info!(name, revision = %revision, "sync complete");
        Ok(())
    }

    /// Uploads `bytes`, retrying retryable failures with backoff.
    pub(crate) async fn upload_with_retry(
        &self,
        name: &str,
        remote_name: &str,
        bytes: &[u8],
        cancel: &CancelSignal,
    ) -> SyncResult<Revision> {
        self.set_state(name, SyncState::Uploading);
        let retry = &self.config.retry;
        let attempts = retry.attempts();

        let mut attempt = 0;
        loop {
            if attempt > 0 {
                let delay = retry.pause_before(attempt);
                debug!(remote_name, attempt, ?delay, "retrying upload");
                pause(cancel, delay).await?;
                self.stats.write().retries += 1;
            }

            let call = self.remote.upload(remote_name, bytes);
            match guarded(cancel, self.config.timeout, "upload", call).await {
                Ok(revision) => {
                    self.stats.write().uploads += 1;
                    return Ok(revision);
                }
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    warn!(remote_name, attempt, error = %e, "upload failed");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn record_download(&self) {
        self.stats.write().downloads += 1;
    }
}

/// Drives synchronization of marked databases against a remote store.
///
/// One driver serves every database of a registry and tracks a
/// [`SyncState`] per database. Syncs of the same database are serialized by
/// the model's lease: a second `sync` while the first (or its conflict
/// resolver) is alive fails with [`SyncError::Busy`]. Syncs of different
/// databases may run concurrently.
pub struct SyncDriver {
    shared: Arc<SyncShared>,
}

impl SyncDriver {
    /// Creates a driver.
    pub fn new(
        registry: Arc<DatabaseRegistry>,
        tracker: Arc<MembershipTracker>,
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            shared: Arc::new(SyncShared {
                registry,
                tracker,
                remote,
                config,
                states: RwLock::new(HashMap::new()),
                stats: RwLock::new(SyncStats::default()),
            }),
        }
    }

    /// Returns the state of the last or running sync of `name`.
    ///
    /// Names that were never synced are [`SyncState::Idle`].
    pub fn state(&self, name: &str) -> SyncState {
        self.shared.state(name)
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> SyncStats {
        self.shared.stats.read().clone()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// Returns the membership tracker.
    pub fn tracker(&self) -> &Arc<MembershipTracker> {
        &self.shared.tracker
    }

    /// Returns the registry whose databases are synced.
    pub fn registry(&self) -> &Arc<DatabaseRegistry> {
        &self.shared.registry
    }

    /// Syncs one open, marked database.
    ///
    /// Cancelling `cancel` at any await point returns
    /// [`SyncError::Cancelled`] with the model and the last known revision
    /// unchanged.
    ///
    /// # Errors
    ///
    /// - [`SyncError::UnknownName`], [`SyncError::NotMarked`] or
    ///   [`SyncError::NotOpen`] if the database cannot be synced
    /// - [`SyncError::Busy`] if another sync or resolution holds it
    /// - [`SyncError::Network`] or [`SyncError::DecryptFailed`] on remote
    ///   failures
    pub async fn sync(&self, name: &str, cancel: &CancelSignal) -> SyncResult<SyncOutcome> {
        let result = self.run(name, cancel).await;
        if let Err(e) = &result {
            self.shared.fail(name, e);
        }
        result
    }

    /// Syncs every marked database that is open, one after another.
    ///
    /// Marked databases that are closed are skipped. Conflicts are returned
    /// in the outcomes and keep their database leased until dropped.
    pub async fn sync_all(&self, cancel: &CancelSignal) -> Vec<(String, SyncResult<SyncOutcome>)> {
        let names = match self.shared.tracker.marked_names() {
            Ok(names) => names,
            Err(e) => return vec![(String::new(), Err(e))],
        };

        let mut outcomes = Vec::new();
        for name in names {
            if !self.shared.registry.is_open(&name) {
                debug!(name = %name, "skipping closed database");
                continue;
            }
            if cancel.is_cancelled() {
                outcomes.push((name, Err(SyncError::Cancelled)));
                continue;
            }
            let outcome = self.sync(&name, cancel).await;
            outcomes.push((name, outcome));
        }
        outcomes
    }

    async fn run(&self, name: &str, cancel: &CancelSignal) -> SyncResult<SyncOutcome> {
        let shared = &self.shared;
        if !shared.registry.contains(name) {
            return Err(SyncError::UnknownName {
                name: name.to_string(),
            });
        }
        if !shared.tracker.is_marked(name)? {
            return Err(SyncError::NotMarked {
                name: name.to_string(),
            });
        }
        let model = shared.registry.get_open(name)?;
        let lease = model.try_lease()?;

        let remote_name = shared.config.remote_name(name);
        let last_known = shared.tracker.revision_for(name)?;
        let dirty = model.is_dirty() || shared.tracker.is_locally_modified(name)?;

        shared.set_state(name, SyncState::CheckingRemote);
        let call = shared.remote.get_revision(&remote_name);
        let remote_revision = guarded(cancel, shared.config.timeout, "revision check", call).await?;

        shared.set_state(name, SyncState::ComparingRevisions);
        match (remote_revision, last_known) {
            (None, None) => {
                debug!(name, "first sync, remote copy missing");
                self.upload(name, &remote_name, &lease, cancel).await
            }
            (None, Some(last)) => {
                warn!(name, last = %last, "remote copy disappeared, restoring it");
                self.upload(name, &remote_name, &lease, cancel).await
            }
            (Some(remote), Some(last)) if remote == last => {
                if dirty {
                    self.upload(name, &remote_name, &lease, cancel).await
                } else {
                    shared.set_state(name, SyncState::NoConflictNone);
                    shared.complete(name, &last)?;
                    Ok(SyncOutcome::UpToDate)
                }
            }
            (Some(_), _) => self.download(name, &remote_name, lease, dirty, cancel).await,
        }
    }

    async fn upload(
        &self,
        name: &str,
        remote_name: &str,
        lease: &ModelLease,
        cancel: &CancelSignal,
    ) -> SyncResult<SyncOutcome> {
        let shared = &self.shared;
        shared.set_state(name, SyncState::NoConflictUpload);

        let bytes = lease.sealed_bytes()?;
        let revision = shared
            .upload_with_retry(name, remote_name, &bytes, cancel)
            .await?;

        lease.mark_clean();
        shared.complete(name, &revision)?;
        Ok(SyncOutcome::Uploaded { revision })
    }

    async fn download(
        &self,
        name: &str,
        remote_name: &str,
        lease: ModelLease,
        dirty: bool,
        cancel: &CancelSignal,
    ) -> SyncResult<SyncOutcome> {
        let shared = &self.shared;
        shared.set_state(name, SyncState::Downloading);

        let call = shared.remote.download(remote_name);
        let (bytes, revision) = guarded(cancel, shared.config.timeout, "download", call).await?;
        shared.record_download();

        let remote_contents = lease.unseal(&bytes).map_err(|e| match e {
            CoreError::WrongPassphrase | CoreError::CorruptFile { .. } => SyncError::DecryptFailed {
                message: e.to_string(),
            },
            other => SyncError::from(other),
        })?;

        if !dirty {
            lease.replace_contents(remote_contents)?;
            shared.complete(name, &revision)?;
            info!(name, revision = %revision, "adopted remote copy");
            return Ok(SyncOutcome::Adopted { revision });
        }

        shared.set_state(name, SyncState::Conflicting);
        shared.stats.write().conflicts_detected += 1;
        shared
            .registry
            .events()
            .emit(RegistryEvent::SyncConflictDetected {
                name: name.to_string(),
            });
        info!(name, revision = %revision, "conflict detected");

        Ok(SyncOutcome::Conflict(ConflictResolver::new(
            Arc::clone(shared),
            lease,
            name,
            remote_name,
            remote_contents,
            revision,
        )))
    }
}

impl std::fmt::Debug for SyncDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncDriver")
            .field("databases", &self.shared.states.read().len())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_state_checks() {
        assert!(SyncState::CheckingRemote.is_active());
        assert!(SyncState::Uploading.is_active());
        assert!(!SyncState::Idle.is_active());
        assert!(!SyncState::Conflicting.is_active());

        assert!(SyncState::Done.is_finished());
        assert!(SyncState::Failed.is_finished());
        assert!(!SyncState::Downloading.is_finished());
    }

    #[test]
    fn unknown_names_are_idle_and_busy_keeps_state() {
        use safesync_core::RegistryConfig;
        use safesync_storage::{EncryptedStore, InMemoryBackend, InMemoryStateStore};

        let registry = Arc::new(
            DatabaseRegistry::new(
                Arc::new(EncryptedStore::new(InMemoryBackend::new())),
                Arc::new(InMemoryStateStore::new()),
                RegistryConfig::default(),
            )
            .unwrap(),
        );
        let tracker = Arc::new(MembershipTracker::new(Arc::clone(&registry)).unwrap());
        let driver = SyncDriver::new(
            registry,
            tracker,
            Arc::new(crate::remote::MemoryRemoteStore::new()),
            SyncConfig::default(),
        );
        assert_eq!(driver.state("Work"), SyncState::Idle);

        driver.shared.set_state("Work", SyncState::Downloading);
        driver.shared.fail("Work", &SyncError::Busy { name: "Work".into() });
        assert_eq!(driver.state("Work"), SyncState::Downloading);
        assert_eq!(driver.state("Home"), SyncState::Idle);

        driver.shared.fail("Work", &SyncError::Cancelled);
        assert_eq!(driver.state("Work"), SyncState::Failed);
    }

    #[test]
    fn default_stats_are_zero() {
        let stats = SyncStats::default();
        assert_eq!(stats.cycles_completed, 0);
        assert!(stats.last_error.is_none());
    }
}
