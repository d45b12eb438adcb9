//! # SafeSync Sync
//!
//! Mirrors marked local databases to a revisioned remote object store.
//!
//! This crate provides:
//! - [`MembershipTracker`] - which databases are synced and their last known
//!   remote revision
//! - [`SyncDriver`] - the per-database state machine
//!   (check remote → compare → upload / adopt / conflict)
//! - [`ConflictResolver`] - keep local, keep remote, or merge entry by entry
//! - [`AutoSync`] - syncs marked databases as they are opened and edited
//! - [`RemoteStore`] - the remote abstraction, with [`MemoryRemoteStore`] and
//!   [`DirRemoteStore`]
//!
//! ## Key Invariants
//!
//! - A database with local edits is never overwritten by the remote copy
//!   without an explicit resolution
//! - Nothing is committed locally before the last remote call of a sync
//!   completes, so cancellation and network failures leave local state intact
//! - Entry conflicts are never resolved automatically
//!
//! ## Example
//!
//! ```rust
//! use safesync_core::{DatabaseRegistry, RegistryConfig};
//! use safesync_storage::{EncryptedStore, InMemoryBackend, InMemoryStateStore, Passphrase};
//! use safesync_sync::{
//!     CancelSignal, MembershipTracker, MemoryRemoteStore, SyncConfig, SyncDriver, SyncOutcome,
//! };
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let registry = Arc::new(
//!     DatabaseRegistry::new(
//!         Arc::new(EncryptedStore::new(InMemoryBackend::new())),
//!         Arc::new(InMemoryStateStore::new()),
//!         RegistryConfig::default(),
//!     )
//!     .unwrap(),
//! );
//! registry.create("Personal", "personal.psafe3", &Passphrase::new("pw")).unwrap();
//!
//! let tracker = Arc::new(MembershipTracker::new(Arc::clone(&registry)).unwrap());
//! tracker.mark("Personal").unwrap();
//!
//! let driver = SyncDriver::new(
//!     registry,
//!     tracker,
//!     Arc::new(MemoryRemoteStore::new()),
//!     SyncConfig::default(),
//! );
//! let outcome = driver.sync("Personal", &CancelSignal::new()).await.unwrap();
//! assert!(matches!(outcome, SyncOutcome::Uploaded { .. }));
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod autosync;
mod cancel;
mod config;
mod driver;
mod error;
mod membership;
mod merge;
mod remote;
mod resolver;

pub use autosync::AutoSync;
pub use cancel::CancelSignal;
pub use config::{RetryConfig, SyncConfig};
pub use driver::{SyncDriver, SyncOutcome, SyncState, SyncStats};
pub use error::{SyncError, SyncResult};
pub use membership::{MembershipTracker, SyncRecord, SYNC_NAMESPACE};
pub use merge::{EntryChoice, EntryConflict, MergePlan};
pub use remote::{
    DirRemoteStore, DownloadGate, MemoryRemoteStore, RemoteCallCounts, RemoteError, RemoteStore,
    Revision,
};
pub use resolver::{ConflictResolver, Strategy};
