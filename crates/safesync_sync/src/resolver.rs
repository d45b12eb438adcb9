//! Resolution of a detected sync conflict.

use crate::cancel::CancelSignal;
use crate::driver::SyncShared;
use crate::error::{SyncError, SyncResult};
use crate::merge::MergePlan;
use crate::remote::Revision;
use safesync_core::ModelLease;
use safesync_storage::DatabaseContents;
use std::sync::Arc;
use tracing::info;

/// How a conflict can be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Overwrite the remote copy with the local one.
    KeepLocal,
    /// Replace the local copy with the remote one.
    KeepRemote,
    /// Combine both copies entry by entry.
    Merge,
}

impl Strategy {
    /// Every strategy, in the order offered to users.
    pub const ALL: [Strategy; 3] = [Strategy::KeepLocal, Strategy::KeepRemote, Strategy::Merge];
}

/// A pending conflict between the local database and a downloaded remote copy.
///
/// The resolver holds the database's lease, so local edits and other syncs
/// are rejected until one of the consuming methods runs or the resolver is
/// dropped. Every failure leaves the local model and the last known revision
/// as they were before the conflict; the next sync detects the conflict
/// again.
pub struct ConflictResolver {
    shared: Arc<SyncShared>,
    lease: ModelLease,
    name: String,
    remote_name: String,
    remote_contents: DatabaseContents,
    remote_revision: Revision,
}

impl ConflictResolver {
    pub(crate) fn new(
        shared: Arc<SyncShared>,
        lease: ModelLease,
        name: &str,
        remote_name: &str,
        remote_contents: DatabaseContents,
        remote_revision: Revision,
    ) -> Self {
        Self {
            shared,
            lease,
            name: name.to_string(),
            remote_name: remote_name.to_string(),
            remote_contents,
            remote_revision,
        }
    }

    /// Returns the friendly name of the conflicting database.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the revision of the downloaded remote copy.
    pub fn remote_revision(&self) -> &Revision {
        &self.remote_revision
    }

    /// Returns the downloaded remote contents.
    pub fn remote_contents(&self) -> &DatabaseContents {
        &self.remote_contents
    }

    /// Returns the strategies that can resolve this conflict.
    pub fn strategies(&self) -> &'static [Strategy] {
        &Strategy::ALL
    }

    /// Uploads the local copy over the remote one.
    ///
    /// # Errors
    ///
    /// Returns a network error or [`SyncError::Cancelled`](crate::SyncError::Cancelled)
    /// if the upload does not complete.
    pub async fn keep_local(self, cancel: &CancelSignal) -> SyncResult<Revision> {
        let result = self.upload_local(cancel).await;
        if let Err(e) = &result {
            self.shared.fail(&self.name, e);
        }
        result
    }

    /// Adopts the downloaded remote copy. No network call is made.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the local write fails.
    pub fn keep_remote(self) -> SyncResult<Revision> {
        let result = self.adopt_remote();
        if let Err(e) = &result {
            self.shared.fail(&self.name, e);
        }
        result
    }

    /// Compares the local and remote entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the local model was closed.
    pub fn plan_merge(&self) -> SyncResult<MergePlan> {
        let local = self.lease.model().entries()?;
        Ok(MergePlan::new(&local, &self.remote_contents.entries))
    }

    /// Uploads the merged contents and then commits them locally.
    ///
    /// The plan must come from [`plan_merge`](Self::plan_merge) on this
    /// conflict.
    ///
    /// # Errors
    ///
    /// - [`SyncError::PlanMismatch`] if the plan was computed from other
    ///   entries; nothing is touched
    /// - [`SyncError::MergeIncomplete`](crate::SyncError::MergeIncomplete)
    ///   if some conflict has no choice; nothing is touched
    /// - a network error or `Cancelled` if the upload does not complete
    /// - a storage error if the upload succeeded but the local write failed;
    ///   the revision is then not recorded
    pub async fn merge(self, plan: MergePlan, cancel: &CancelSignal) -> SyncResult<Revision> {
        let result = self.upload_merged(&plan, cancel).await;
        if let Err(e) = &result {
            self.shared.fail(&self.name, e);
        }
        result
    }

    async fn upload_local(&self, cancel: &CancelSignal) -> SyncResult<Revision> {
        let bytes = self.lease.sealed_bytes()?;
        let revision = self
            .shared
            .upload_with_retry(&self.name, &self.remote_name, &bytes, cancel)
            .await?;

        self.lease.mark_clean();
        self.shared.complete(&self.name, &revision)?;
        info!(name = %self.name, "conflict resolved by keeping local copy");
        Ok(revision)
    }

    fn adopt_remote(&self) -> SyncResult<Revision> {
        self.lease.replace_contents(self.remote_contents.clone())?;
        self.shared.complete(&self.name, &self.remote_revision)?;
        info!(name = %self.name, "conflict resolved by keeping remote copy");
        Ok(self.remote_revision.clone())
    }

    async fn upload_merged(&self, plan: &MergePlan, cancel: &CancelSignal) -> SyncResult<Revision> {
        if !self.plan_merge()?.same_basis(plan) {
            return Err(SyncError::PlanMismatch {
                name: self.name.clone(),
            });
        }
        let entries = plan.merged_entries()?;

        let mut merged = self.lease.model().snapshot()?;
        merged.entries = entries;
        merged.header.touch(&self.shared.registry.config().host);

        let bytes = self.lease.seal(&merged)?;
        let revision = self
            .shared
            .upload_with_retry(&self.name, &self.remote_name, &bytes, cancel)
            .await?;

        self.lease.replace_contents(merged)?;
        self.shared.complete(&self.name, &revision)?;
        info!(
            name = %self.name,
            conflicts = plan.conflicts().len(),
            adopted = plan.adopted_count(),
            "conflict resolved by merge"
        );
        Ok(revision)
    }
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("name", &self.name)
            .field("remote_revision", &self.remote_revision)
            .field("remote_entries", &self.remote_contents.entries.len())
            .finish_non_exhaustive()
    }
}
