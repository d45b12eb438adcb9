//! End-to-end sync scenarios against in-memory and directory remotes.

use safesync_core::{CoreError, DatabaseModel, DatabaseRegistry, RegistryConfig, RegistryEvent};
use safesync_storage::{
    DatabaseContents, DatabaseStore, EncryptedStore, Entry, FileBackend, FileStateStore,
    InMemoryBackend, InMemoryStateStore, Passphrase,
};
use safesync_sync::{
    AutoSync, CancelSignal, ConflictResolver, DirRemoteStore, EntryChoice, MembershipTracker, MergePlan,
    MemoryRemoteStore, RemoteError, RetryConfig, Revision, SyncConfig, SyncDriver, SyncError,
    SyncOutcome, SyncState,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const NAME: &str = "Personal";
const REMOTE_NAME: &str = "Personal.psafe3";

fn pw() -> Passphrase {
    Passphrase::new("correct horse")
}

struct Harness {
    registry: Arc<DatabaseRegistry>,
    store: Arc<EncryptedStore<InMemoryBackend>>,
    tracker: Arc<MembershipTracker>,
    remote: Arc<MemoryRemoteStore>,
    driver: Arc<SyncDriver>,
    model: Arc<DatabaseModel>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(
            SyncConfig::new().with_retry(
                RetryConfig::new(3)
                    .with_initial_delay(Duration::from_millis(1))
                    .with_jitter(false),
            ),
        )
    }

    fn with_config(config: SyncConfig) -> Self {
        let store = Arc::new(EncryptedStore::new(InMemoryBackend::new()));
        let registry = Arc::new(
            DatabaseRegistry::new(
                Arc::clone(&store) as Arc<dyn DatabaseStore>,
                Arc::new(InMemoryStateStore::new()),
                RegistryConfig::default().host("laptop"),
            )
            .unwrap(),
        );
        let model = registry.create(NAME, "personal.psafe3", &pw()).unwrap();
        let tracker = Arc::new(MembershipTracker::new(Arc::clone(&registry)).unwrap());
        tracker.mark(NAME).unwrap();

        let remote = Arc::new(MemoryRemoteStore::new());
        let driver = Arc::new(SyncDriver::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
            Arc::clone(&remote) as Arc<dyn safesync_sync::RemoteStore>,
            config,
        ));

        Self {
            registry,
            store,
            tracker,
            remote,
            driver,
            model,
        }
    }

    async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        self.driver.sync(NAME, &CancelSignal::new()).await
    }

    /// Syncs once so local and remote share a revision.
    async fn baseline(&self) -> Revision {
        match self.sync().await.unwrap() {
            SyncOutcome::Uploaded { revision } => revision,
            other => panic!("expected upload, got {other:?}"),
        }
    }

    /// Simulates another device uploading `contents`.
    fn remote_edit(&self, contents: &DatabaseContents) -> Revision {
        let bytes = self.store.encode(&pw(), contents).unwrap();
        self.remote.put(REMOTE_NAME, bytes)
    }

    fn remote_contents(&self) -> DatabaseContents {
        let (bytes, _) = self.remote.get(REMOTE_NAME).unwrap();
        self.store.decode(&bytes, &pw()).unwrap()
    }

    /// Builds a conflict: a remote-only "bank" entry against a local "mail"
    /// entry. Returns the resolver and the remote revision.
    async fn conflict(&self) -> (ConflictResolver, Revision) {
        self.baseline().await;
        let remote_revision =
            self.remote_edit(&self.remote_with(vec![Entry::new("bank", "bob", "1234")]));
        self.model.add_entry(Entry::new("mail", "alice", "pw")).unwrap();
        let resolver = self.sync().await.unwrap().into_conflict().unwrap();
        (resolver, remote_revision)
    }

    /// Asserts that a failed resolution left both sides as they were.
    fn assert_untouched(&self, before: &DatabaseContents, remote_revision: &Revision) {
        assert_eq!(&self.model.snapshot().unwrap(), before);
        assert!(self.model.is_dirty());
        assert!(self.tracker.is_locally_modified(NAME).unwrap());
        assert_ne!(self.tracker.revision_for(NAME).unwrap().as_ref(), Some(remote_revision));
        let (_, current) = self.remote.get(REMOTE_NAME).unwrap();
        assert_eq!(&current, remote_revision);
        assert_eq!(self.remote_contents().entries[0].title, "bank");
        assert_eq!(self.driver.state(NAME), SyncState::Failed);
    }

    fn remote_with(&self, entries: Vec<Entry>) -> DatabaseContents {
        let mut contents = self.model.snapshot().unwrap();
        contents.entries = entries;
        contents.header.touch("phone");
        contents
    }
}

#[tokio::test]
async fn first_sync_uploads_when_remote_missing() {
    let h = Harness::new();
    h.model.add_entry(Entry::new("mail", "alice", "pw")).unwrap();

    let revision = h.baseline().await;

    assert_eq!(h.tracker.revision_for(NAME).unwrap(), Some(revision));
    assert_eq!(h.remote_contents().entries, h.model.entries().unwrap());
    assert!(!h.model.is_dirty());
    assert!(!h.tracker.is_locally_modified(NAME).unwrap());
    assert_eq!(h.driver.state(NAME), SyncState::Done);
}

#[tokio::test]
async fn remote_unchanged_and_clean_transfers_nothing() {
    let h = Harness::new();
    h.baseline().await;
    let before = h.remote.calls();

    let outcome = h.sync().await.unwrap();

    assert!(matches!(outcome, SyncOutcome::UpToDate));
    let after = h.remote.calls();
    assert_eq!(after.uploads, before.uploads);
    assert_eq!(after.downloads, before.downloads);
}

#[tokio::test]
async fn remote_unchanged_and_dirty_uploads() {
    let h = Harness::new();
    h.baseline().await;
    h.model.add_entry(Entry::new("mail", "alice", "pw")).unwrap();

    let revision = match h.sync().await.unwrap() {
        SyncOutcome::Uploaded { revision } => revision,
        other => panic!("expected upload, got {other:?}"),
    };

    let (_, stored) = h.remote.get(REMOTE_NAME).unwrap();
    assert_eq!(revision, stored);
    assert_eq!(h.tracker.revision_for(NAME).unwrap(), Some(revision));
    assert_eq!(h.remote_contents().entries.len(), 1);
    assert!(!h.model.is_dirty());
}

#[tokio::test]
async fn remote_changed_and_clean_adopts_without_resolution() {
    let h = Harness::new();
    h.baseline().await;
    let remote = h.remote_with(vec![Entry::new("bank", "bob", "1234")]);
    let remote_revision = h.remote_edit(&remote);
    let handle = h.registry.get_open(NAME).unwrap();

    let outcome = h.sync().await.unwrap();

    assert!(matches!(outcome, SyncOutcome::Adopted { ref revision } if *revision == remote_revision));
    assert!(Arc::ptr_eq(&handle, &h.model));
    assert_eq!(h.model.snapshot().unwrap(), remote);
    assert!(!h.model.is_dirty());
    assert_eq!(h.tracker.revision_for(NAME).unwrap(), Some(remote_revision));
    assert!(!h.tracker.is_locally_modified(NAME).unwrap());
}

#[tokio::test]
async fn remote_changed_and_dirty_hands_out_resolver() {
    let h = Harness::new();
    let baseline = h.baseline().await;
    h.remote_edit(&h.remote_with(vec![Entry::new("bank", "bob", "1234")]));
    h.model.add_entry(Entry::new("mail", "alice", "pw")).unwrap();
    let events = h.registry.events().subscribe();

    let resolver = h.sync().await.unwrap().into_conflict().unwrap();

    assert_eq!(h.driver.state(NAME), SyncState::Conflicting);
    assert_eq!(resolver.name(), NAME);
    assert_eq!(resolver.strategies().len(), 3);
    assert!(events.try_iter().any(|e| e
        == RegistryEvent::SyncConflictDetected {
            name: NAME.to_string()
        }));

    // The resolver holds the database.
    assert!(matches!(
        h.model.add_entry(Entry::new("x", "y", "z")),
        Err(CoreError::Busy { .. })
    ));
    assert!(matches!(h.sync().await, Err(SyncError::Busy { .. })));
    assert_eq!(h.tracker.revision_for(NAME).unwrap(), Some(baseline.clone()));

    drop(resolver);
    h.model.add_entry(Entry::new("x", "y", "z")).unwrap();
    assert_eq!(h.tracker.revision_for(NAME).unwrap(), Some(baseline));
}

#[tokio::test]
async fn keep_local_overwrites_remote() {
    let h = Harness::new();
    h.baseline().await;
    h.remote_edit(&h.remote_with(vec![Entry::new("bank", "bob", "1234")]));
    h.model.add_entry(Entry::new("mail", "alice", "pw")).unwrap();

    let resolver = h.sync().await.unwrap().into_conflict().unwrap();
    let revision = resolver.keep_local(&CancelSignal::new()).await.unwrap();

    assert_eq!(h.remote_contents().entries, h.model.entries().unwrap());
    assert_eq!(h.tracker.revision_for(NAME).unwrap(), Some(revision));
    assert!(!h.model.is_dirty());
    assert!(matches!(h.sync().await.unwrap(), SyncOutcome::UpToDate));
}

#[tokio::test]
async fn keep_remote_adopts_without_network() {
    let h = Harness::new();
    h.baseline().await;
    let remote = h.remote_with(vec![Entry::new("bank", "bob", "1234")]);
    let remote_revision = h.remote_edit(&remote);
    h.model.add_entry(Entry::new("mail", "alice", "pw")).unwrap();

    let resolver = h.sync().await.unwrap().into_conflict().unwrap();
    let uploads = h.remote.calls().uploads;
    let revision = resolver.keep_remote().unwrap();

    assert_eq!(revision, remote_revision);
    assert_eq!(h.remote.calls().uploads, uploads);
    assert_eq!(h.model.snapshot().unwrap(), remote);
    assert!(!h.model.is_dirty());
    assert!(!h.tracker.is_locally_modified(NAME).unwrap());
}

#[tokio::test]
async fn merge_of_disjoint_additions_keeps_both() {
    let h = Harness::new();
    h.baseline().await;
    let remote_entry = Entry::new("bank", "bob", "1234");
    h.remote_edit(&h.remote_with(vec![remote_entry.clone()]));
    let local_key = h.model.add_entry(Entry::new("mail", "alice", "pw")).unwrap();

    let resolver = h.sync().await.unwrap().into_conflict().unwrap();
    let plan = resolver.plan_merge().unwrap();
    assert!(plan.is_complete());
    let revision = resolver.merge(plan, &CancelSignal::new()).await.unwrap();

    let merged = h.model.entries().unwrap();
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].key(), local_key);
    assert_eq!(merged[1], remote_entry);
    assert_eq!(h.remote_contents().entries, merged);
    assert_eq!(h.tracker.revision_for(NAME).unwrap(), Some(revision));
    assert!(!h.model.is_dirty());
}

#[tokio::test]
async fn differing_password_needs_explicit_choice() {
    let h = Harness::new();
    let key = h.model.add_entry(Entry::new("mail", "alice", "original")).unwrap();
    let baseline = h.baseline().await;

    let mut remote_entry = h.model.entry(&key).unwrap();
    remote_entry.password = "changed-on-phone".into();
    h.remote_edit(&h.remote_with(vec![remote_entry.clone()]));

    let mut local_entry = h.model.entry(&key).unwrap();
    local_entry.password = "changed-on-laptop".into();
    h.model.update_entry(&key, local_entry).unwrap();
    let before = h.model.snapshot().unwrap();

    let resolver = h.sync().await.unwrap().into_conflict().unwrap();
    let plan = resolver.plan_merge().unwrap();
    assert_eq!(plan.unresolved(), vec![key.clone()]);

    let err = resolver
        .merge(plan, &CancelSignal::new())
        .await
        .unwrap_err();
    match err {
        SyncError::MergeIncomplete { unresolved } => {
            assert_eq!(unresolved, vec![key.to_string()]);
        }
        other => panic!("expected MergeIncomplete, got {other:?}"),
    }
    assert_eq!(h.model.snapshot().unwrap(), before);
    assert_eq!(h.tracker.revision_for(NAME).unwrap(), Some(baseline));

    // Retry with a choice.
    let resolver = h.sync().await.unwrap().into_conflict().unwrap();
    let mut plan = resolver.plan_merge().unwrap();
    assert!(plan.choose(&key, EntryChoice::KeepRemote));
    resolver.merge(plan, &CancelSignal::new()).await.unwrap();

    assert_eq!(h.model.entries().unwrap(), vec![remote_entry]);
}

#[tokio::test]
async fn cancel_mid_download_changes_nothing() {
    let h = Harness::new();
    let baseline = h.baseline().await;
    h.remote_edit(&h.remote_with(vec![Entry::new("bank", "bob", "1234")]));
    let before = h.model.snapshot().unwrap();

    let gate = h.remote.hold_downloads();
    let cancel = CancelSignal::new();
    let task = {
        let driver = Arc::clone(&h.driver);
        let cancel = cancel.clone();
        tokio::spawn(async move { driver.sync(NAME, &cancel).await.map(|_| ()) })
    };

    gate.entered().await;
    assert_eq!(h.driver.state(NAME), SyncState::Downloading);
    cancel.cancel();
    cancel.cancel();

    assert!(matches!(task.await.unwrap(), Err(SyncError::Cancelled)));
    assert_eq!(h.model.snapshot().unwrap(), before);
    assert_eq!(h.tracker.revision_for(NAME).unwrap(), Some(baseline));
    assert_eq!(h.driver.state(NAME), SyncState::Failed);

    // Lease released.
    h.model.add_entry(Entry::new("mail", "alice", "pw")).unwrap();
}

#[tokio::test]
async fn cancelled_before_start_touches_nothing() {
    let h = Harness::new();
    h.model.add_entry(Entry::new("mail", "alice", "pw")).unwrap();
    let cancel = CancelSignal::new();
    cancel.cancel();

    assert!(matches!(
        h.driver.sync(NAME, &cancel).await,
        Err(SyncError::Cancelled)
    ));
    assert_eq!(h.remote.calls().uploads, 0);
    assert!(h.model.is_dirty());
}

#[tokio::test]
async fn slow_remote_times_out_as_retryable() {
    let h = Harness::with_config(SyncConfig::new().with_timeout(Duration::from_millis(20)));
    h.baseline().await;
    h.remote_edit(&h.remote_with(vec![]));
    let _gate = h.remote.hold_downloads();

    let err = h.sync().await.unwrap_err();

    assert!(matches!(err, SyncError::Network { retryable: true, .. }));
    assert!(h.driver.stats().last_error.is_some());
}

#[tokio::test]
async fn transient_upload_failures_are_retried() {
    let h = Harness::new();
    h.model.add_entry(Entry::new("mail", "alice", "pw")).unwrap();
    h.remote.fail_uploads(2, RemoteError::transient("connection reset"));

    let outcome = h.sync().await.unwrap();

    assert!(matches!(outcome, SyncOutcome::Uploaded { .. }));
    assert_eq!(h.driver.stats().retries, 2);
    assert_eq!(h.driver.stats().uploads, 1);
}

#[tokio::test]
async fn exhausted_retries_keep_local_state() {
    let h = Harness::new();
    let baseline = h.baseline().await;
    h.model.add_entry(Entry::new("mail", "alice", "pw")).unwrap();
    h.remote.fail_uploads(5, RemoteError::transient("offline"));

    let err = h.sync().await.unwrap_err();

    assert!(err.is_retryable());
    assert!(h.model.is_dirty());
    assert_eq!(h.tracker.revision_for(NAME).unwrap(), Some(baseline));
    assert_eq!(h.driver.state(NAME), SyncState::Failed);
}

#[tokio::test]
async fn fatal_upload_failure_is_not_retried() {
    let h = Harness::new();
    h.remote.fail_uploads(1, RemoteError::fatal("quota exceeded"));

    let err = h.sync().await.unwrap_err();

    assert!(matches!(err, SyncError::Network { retryable: false, .. }));
    assert_eq!(h.driver.stats().retries, 0);
}

#[tokio::test]
async fn undecryptable_remote_is_reported() {
    let h = Harness::new();
    h.baseline().await;
    let foreign = h
        .store
        .encode(&Passphrase::new("other"), &DatabaseContents::empty("phone"))
        .unwrap();
    h.remote.put(REMOTE_NAME, foreign);
    let before = h.model.snapshot().unwrap();

    assert!(matches!(
        h.sync().await,
        Err(SyncError::DecryptFailed { .. })
    ));
    assert_eq!(h.model.snapshot().unwrap(), before);

    h.remote.put(REMOTE_NAME, b"not a database".to_vec());
    assert!(matches!(
        h.sync().await,
        Err(SyncError::DecryptFailed { .. })
    ));
}

#[tokio::test]
async fn sync_requires_mark_and_open() {
    let h = Harness::new();

    assert!(matches!(
        h.driver.sync("Missing", &CancelSignal::new()).await,
        Err(SyncError::UnknownName { .. })
    ));

    h.tracker.unmark(NAME).unwrap();
    assert!(matches!(h.sync().await, Err(SyncError::NotMarked { .. })));

    h.tracker.mark(NAME).unwrap();
    h.registry.close(NAME);
    assert!(matches!(h.sync().await, Err(SyncError::NotOpen { .. })));
}

#[tokio::test]
async fn completed_sync_is_announced() {
    let h = Harness::new();
    let events = h.registry.events().subscribe();

    let revision = h.baseline().await;

    assert!(events.try_iter().any(|e| e
        == RegistryEvent::SyncCompleted {
            name: NAME.to_string(),
            revision: revision.to_string(),
        }));
}

#[tokio::test]
async fn sync_all_covers_open_marked_databases() {
    let h = Harness::new();
    h.registry.create("Work", "work.psafe3", &pw()).unwrap();
    h.registry.create("Closed", "closed.psafe3", &pw()).unwrap();
    h.registry.create("Unmarked", "unmarked.psafe3", &pw()).unwrap();
    h.tracker.mark("Work").unwrap();
    h.tracker.mark("Closed").unwrap();
    h.registry.close("Closed");

    let outcomes = h.driver.sync_all(&CancelSignal::new()).await;

    let names: Vec<_> = outcomes.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec![NAME, "Work"]);
    assert!(outcomes
        .iter()
        .all(|(_, o)| matches!(o, Ok(SyncOutcome::Uploaded { .. }))));
    assert!(h.remote.get("Work.psafe3").is_some());
}

#[tokio::test]
async fn removed_database_leaves_membership() {
    let h = Harness::new();
    h.baseline().await;

    h.registry.remove(NAME).unwrap();

    assert!(h.tracker.marked_names().unwrap().is_empty());
    assert!(h.remote.get(REMOTE_NAME).is_some());
}

#[tokio::test]
async fn edits_before_restart_are_uploaded_after_restart() {
    let dir = tempdir().unwrap();
    let remote = Arc::new(DirRemoteStore::open(&dir.path().join("remote")).unwrap());
    let open = || {
        let registry = Arc::new(
            DatabaseRegistry::new(
                Arc::new(EncryptedStore::new(
                    FileBackend::open(&dir.path().join("docs")).unwrap(),
                )),
                Arc::new(FileStateStore::open(&dir.path().join("state.cbor")).unwrap()),
                RegistryConfig::default(),
            )
            .unwrap(),
        );
        let tracker = Arc::new(MembershipTracker::new(Arc::clone(&registry)).unwrap());
        let driver = SyncDriver::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
            Arc::clone(&remote) as Arc<dyn safesync_sync::RemoteStore>,
            SyncConfig::default(),
        );
        (registry, tracker, driver)
    };

    {
        let (registry, tracker, driver) = open();
        let model = registry.create(NAME, "personal.psafe3", &pw()).unwrap();
        tracker.mark(NAME).unwrap();
        driver.sync(NAME, &CancelSignal::new()).await.unwrap();

        model.add_entry(Entry::new("mail", "alice", "pw")).unwrap();
    }

    let (registry, tracker, driver) = open();
    let model = registry.open(NAME, &pw()).unwrap();
    assert!(!model.is_dirty());
    assert!(tracker.is_locally_modified(NAME).unwrap());

    let outcome = driver.sync(NAME, &CancelSignal::new()).await.unwrap();

    match outcome {
        SyncOutcome::Uploaded { revision } => assert_eq!(revision.as_str(), "2"),
        other => panic!("expected upload, got {other:?}"),
    }
    assert!(!tracker.is_locally_modified(NAME).unwrap());
}

#[tokio::test]
async fn edit_before_restart_conflicts_with_newer_remote() {
    use safesync_sync::RemoteStore;

    let dir = tempdir().unwrap();
    let remote = Arc::new(DirRemoteStore::open(&dir.path().join("remote")).unwrap());
    let open = || {
        let registry = Arc::new(
            DatabaseRegistry::new(
                Arc::new(EncryptedStore::new(
                    FileBackend::open(&dir.path().join("docs")).unwrap(),
                )),
                Arc::new(FileStateStore::open(&dir.path().join("state.cbor")).unwrap()),
                RegistryConfig::default().host("laptop"),
            )
            .unwrap(),
        );
        let tracker = Arc::new(MembershipTracker::new(Arc::clone(&registry)).unwrap());
        let driver = SyncDriver::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
            Arc::clone(&remote) as Arc<dyn RemoteStore>,
            SyncConfig::default(),
        );
        (registry, tracker, driver)
    };

    let mut phone_copy = {
        let (registry, tracker, driver) = open();
        let model = registry.create(NAME, "personal.psafe3", &pw()).unwrap();
        tracker.mark(NAME).unwrap();
        driver.sync(NAME, &CancelSignal::new()).await.unwrap();
        let synced = model.snapshot().unwrap();

        // Edit and shut down without touching the tracker again.
        model.add_entry(Entry::new("mail", "alice", "pw")).unwrap();
        synced
    };

    phone_copy.entries.push(Entry::new("bank", "bob", "1234"));
    phone_copy.header.touch("phone");
    let sealed = EncryptedStore::new(InMemoryBackend::new())
        .encode(&pw(), &phone_copy)
        .unwrap();
    remote.upload(REMOTE_NAME, &sealed).await.unwrap();

    let (registry, _tracker, driver) = open();
    let model = registry.open(NAME, &pw()).unwrap();
    let resolver = match driver.sync(NAME, &CancelSignal::new()).await.unwrap() {
        SyncOutcome::Conflict(resolver) => resolver,
        other => panic!("expected conflict, got {other:?}"),
    };
    assert_eq!(model.entries().unwrap()[0].title, "mail");

    let plan = resolver.plan_merge().unwrap();
    assert!(plan.is_complete());
    resolver.merge(plan, &CancelSignal::new()).await.unwrap();

    let mut titles: Vec<_> = model.entries().unwrap().into_iter().map(|e| e.title).collect();
    titles.sort();
    assert_eq!(titles, vec!["bank", "mail"]);
}

#[tokio::test]
async fn merge_rejects_plan_from_other_entries() {
    let h = Harness::new();
    let (resolver, remote_revision) = h.conflict().await;
    let before = h.model.snapshot().unwrap();

    let mut foreign = MergePlan::new(&[], &[]);
    foreign.choose_all(EntryChoice::KeepLocal);
    let err = resolver
        .merge(foreign, &CancelSignal::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::PlanMismatch { .. }));
    h.assert_untouched(&before, &remote_revision);

    // The conflict is found again and the real plan still applies.
    let resolver = h.sync().await.unwrap().into_conflict().unwrap();
    let plan = resolver.plan_merge().unwrap();
    resolver.merge(plan, &CancelSignal::new()).await.unwrap();
    assert_eq!(h.model.entry_count().unwrap(), 2);
}

#[tokio::test]
async fn keep_local_upload_failure_keeps_both_sides() {
    let h = Harness::new();
    let (resolver, remote_revision) = h.conflict().await;
    let before = h.model.snapshot().unwrap();
    h.remote.fail_uploads(5, RemoteError::transient("offline"));

    let err = resolver.keep_local(&CancelSignal::new()).await.unwrap_err();

    assert!(err.is_retryable());
    h.assert_untouched(&before, &remote_revision);
    // Lease released.
    h.model.add_entry(Entry::new("x", "y", "z")).unwrap();
}

#[tokio::test]
async fn merge_upload_failure_keeps_both_sides() {
    let h = Harness::new();
    let (resolver, remote_revision) = h.conflict().await;
    let before = h.model.snapshot().unwrap();
    h.remote.fail_uploads(5, RemoteError::transient("offline"));

    let plan = resolver.plan_merge().unwrap();
    let err = resolver.merge(plan, &CancelSignal::new()).await.unwrap_err();

    assert!(err.is_retryable());
    h.assert_untouched(&before, &remote_revision);
    assert!(h.sync().await.unwrap().is_conflict());
}

#[tokio::test]
async fn cancelled_keep_local_keeps_both_sides() {
    let h = Harness::new();
    let (resolver, remote_revision) = h.conflict().await;
    let before = h.model.snapshot().unwrap();
    let cancel = CancelSignal::new();
    cancel.cancel();

    let err = resolver.keep_local(&cancel).await.unwrap_err();

    assert!(matches!(err, SyncError::Cancelled));
    h.assert_untouched(&before, &remote_revision);
}

#[tokio::test]
async fn cancel_during_merge_retry_keeps_both_sides() {
    let h = Harness::with_config(
        SyncConfig::new().with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_secs(60))
                .with_jitter(false),
        ),
    );
    let (resolver, remote_revision) = h.conflict().await;
    let before = h.model.snapshot().unwrap();
    h.remote.fail_uploads(1, RemoteError::transient("connection reset"));

    let cancel = CancelSignal::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let plan = resolver.plan_merge()?;
            resolver.merge(plan, &cancel).await
        })
    };

    // The first attempt fails at once; the task then waits out the backoff.
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    assert!(matches!(task.await.unwrap(), Err(SyncError::Cancelled)));
    h.assert_untouched(&before, &remote_revision);
    assert_eq!(h.remote.calls().uploads, 1);
}

#[tokio::test]
async fn concurrent_syncs_report_their_own_state() {
    let h = Harness::new();
    h.baseline().await;
    h.remote_edit(&h.remote_with(vec![Entry::new("bank", "bob", "1234")]));
    h.registry.create("Work", "work.psafe3", &pw()).unwrap();
    h.tracker.mark("Work").unwrap();

    let gate = h.remote.hold_downloads();
    let personal = {
        let driver = Arc::clone(&h.driver);
        tokio::spawn(async move { driver.sync(NAME, &CancelSignal::new()).await.map(|_| ()) })
    };
    gate.entered().await;

    let work = h.driver.sync("Work", &CancelSignal::new()).await.unwrap();
    assert!(matches!(work, SyncOutcome::Uploaded { .. }));
    assert_eq!(h.driver.state("Work"), SyncState::Done);
    assert_eq!(h.driver.state(NAME), SyncState::Downloading);

    // A rejected second sync does not disturb the running one.
    assert!(matches!(h.sync().await, Err(SyncError::Busy { .. })));
    assert_eq!(h.driver.state(NAME), SyncState::Downloading);

    gate.release();
    personal.await.unwrap().unwrap();
    assert_eq!(h.driver.state(NAME), SyncState::Done);
}

/// Polls `check` until it holds or two seconds pass.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn auto_sync_uploads_edits() {
    let h = Harness::new();
    h.baseline().await;
    let auto = AutoSync::start(Arc::clone(&h.driver));

    h.model.add_entry(Entry::new("mail", "alice", "pw")).unwrap();

    eventually("upload", || h.remote.calls().uploads == 2).await;
    eventually("sync recorded", || {
        !h.tracker.is_locally_modified(NAME).unwrap() && !h.model.is_leased()
    })
    .await;
    assert_eq!(h.remote_contents().entries, h.model.entries().unwrap());
    auto.stop().await;
}

#[tokio::test]
async fn auto_sync_runs_when_marked_database_opens() {
    let h = Harness::new();
    h.registry.close(NAME);
    let auto = AutoSync::start(Arc::clone(&h.driver));

    h.registry.open(NAME, &pw()).unwrap();

    eventually("first upload", || h.remote.get(REMOTE_NAME).is_some()).await;
    eventually("sync recorded", || h.tracker.revision_for(NAME).unwrap().is_some()).await;
    auto.stop().await;
}

#[tokio::test]
async fn auto_sync_ignores_unmarked_databases() {
    let h = Harness::new();
    h.baseline().await;
    let auto = AutoSync::start(Arc::clone(&h.driver));

    let work = h.registry.create("Work", "work.psafe3", &pw()).unwrap();
    work.add_entry(Entry::new("vpn", "carol", "pw")).unwrap();
    // Triggers are handled in order, so this upload comes after the Work ones.
    h.model.add_entry(Entry::new("mail", "alice", "pw")).unwrap();

    eventually("upload", || h.remote.calls().uploads == 2).await;
    assert!(h.remote.get("Work.psafe3").is_none());
    auto.stop().await;
}

#[tokio::test]
async fn auto_sync_leaves_conflicts_for_manual_resolution() {
    let h = Harness::new();
    let baseline = h.baseline().await;
    h.remote_edit(&h.remote_with(vec![Entry::new("bank", "bob", "1234")]));
    let auto = AutoSync::start(Arc::clone(&h.driver));

    h.model.add_entry(Entry::new("mail", "alice", "pw")).unwrap();

    eventually("conflict", || h.driver.stats().conflicts_detected == 1).await;
    eventually("lease released", || !h.model.is_leased()).await;
    auto.stop().await;

    assert_eq!(h.model.entries().unwrap()[0].title, "mail");
    assert_eq!(h.model.entry_count().unwrap(), 1);
    assert_eq!(h.tracker.revision_for(NAME).unwrap(), Some(baseline));
    assert!(h.sync().await.unwrap().is_conflict());
}

#[tokio::test]
async fn stopped_auto_sync_stops_listening() {
    let h = Harness::new();
    h.baseline().await;
    let listeners = h.registry.events().listener_count();

    let auto = AutoSync::start(Arc::clone(&h.driver));
    assert_eq!(h.registry.events().listener_count(), listeners + 1);
    auto.stop().await;
    assert_eq!(h.registry.events().listener_count(), listeners);

    h.model.add_entry(Entry::new("mail", "alice", "pw")).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.remote.calls().uploads, 1);
    assert!(h.tracker.is_locally_modified(NAME).unwrap());
}
