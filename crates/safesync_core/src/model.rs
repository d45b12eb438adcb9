//! An unlocked, in-memory database.

use crate::error::{CoreError, CoreResult};
use crate::events::{EventFeed, RegistryEvent};
use parking_lot::RwLock;
use safesync_storage::{DatabaseContents, DatabaseStore, Entry, EntryKey, Header, Passphrase};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroize;

struct ModelState {
    contents: DatabaseContents,
    passphrase: Passphrase,
    dirty: bool,
    closed: bool,
}

/// An open database.
///
/// The registry hands out one `Arc<DatabaseModel>` per friendly name; opening
/// the same name twice returns the same handle.
///
/// Every mutation writes the whole database through the backing store first
/// and only then commits in memory, so a failed write leaves the model as it
/// was. A successful mutation marks the model dirty and emits
/// [`RegistryEvent::Changed`] before releasing its lock, so feed listeners
/// must not call back into the model.
///
/// While a [`ModelLease`] is held (a sync or conflict resolution is in
/// flight), local mutations fail with [`CoreError::Busy`].
pub struct DatabaseModel {
    name: RwLock<String>,
    file_id: String,
    host: String,
    store: Arc<dyn DatabaseStore>,
    feed: Arc<EventFeed>,
    state: RwLock<ModelState>,
    leased: AtomicBool,
}

impl DatabaseModel {
    pub(crate) fn new(
        name: &str,
        file_id: &str,
        host: &str,
        store: Arc<dyn DatabaseStore>,
        feed: Arc<EventFeed>,
        contents: DatabaseContents,
        passphrase: Passphrase,
    ) -> Self {
        Self {
            name: RwLock::new(name.to_string()),
            file_id: file_id.to_string(),
            host: host.to_string(),
            store,
            feed,
            state: RwLock::new(ModelState {
                contents,
                passphrase,
                dirty: false,
                closed: false,
            }),
            leased: AtomicBool::new(false),
        }
    }

    /// Returns the current friendly name.
    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    /// Returns the backing file identifier.
    #[must_use]
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// Returns true if there are local edits not yet synced.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    /// Returns true once the registry has closed this handle.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Returns true while a sync or conflict resolution holds the model.
    #[must_use]
    pub fn is_leased(&self) -> bool {
        self.leased.load(Ordering::SeqCst)
    }

    /// Returns a copy of all entries in order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] if the model was closed.
    pub fn entries(&self) -> CoreResult<Vec<Entry>> {
        Ok(self.read_open()?.contents.entries.clone())
    }

    /// Returns a copy of the entry with the given key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntryNotFound`] if no entry matches.
    pub fn entry(&self, key: &EntryKey) -> CoreResult<Entry> {
        self.read_open()?
            .contents
            .entries
            .iter()
            .find(|e| &e.key() == key)
            .cloned()
            .ok_or_else(|| CoreError::EntryNotFound {
                key: key.to_string(),
            })
    }

    /// Returns the number of entries.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] if the model was closed.
    pub fn entry_count(&self) -> CoreResult<usize> {
        Ok(self.read_open()?.contents.entries.len())
    }

    /// Returns a copy of the header.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] if the model was closed.
    pub fn header(&self) -> CoreResult<Header> {
        Ok(self.read_open()?.contents.header.clone())
    }

    /// Returns the format version as shown to users, e.g. `"3.x"`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] if the model was closed.
    pub fn version_string(&self) -> CoreResult<String> {
        Ok(self.read_open()?.contents.header.version.to_string())
    }

    /// Returns a copy of the full contents.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] if the model was closed.
    pub fn snapshot(&self) -> CoreResult<DatabaseContents> {
        Ok(self.read_open()?.contents.clone())
    }

    /// Returns true if `passphrase` is the one this model was unlocked with.
    #[must_use]
    pub fn check_passphrase(&self, passphrase: &Passphrase) -> bool {
        let state = self.state.read();
        !state.closed && state.passphrase.matches(passphrase)
    }

    /// Appends an entry and returns its key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Busy`] while leased, or a storage error if the
    /// write fails.
    pub fn add_entry(&self, entry: Entry) -> CoreResult<EntryKey> {
        let key = entry.key();
        self.mutate(|contents| {
            contents.entries.push(entry);
            Ok(())
        })?;
        Ok(key)
    }

    /// Replaces the entry with the given key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntryNotFound`] if no entry matches.
    pub fn update_entry(&self, key: &EntryKey, entry: Entry) -> CoreResult<()> {
        self.mutate(|contents| {
            let slot = contents
                .entries
                .iter_mut()
                .find(|e| &e.key() == key)
                .ok_or_else(|| CoreError::EntryNotFound {
                    key: key.to_string(),
                })?;
            *slot = entry;
            Ok(())
        })
    }

    /// Removes the entry with the given key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntryNotFound`] if no entry matches.
    pub fn remove_entry(&self, key: &EntryKey) -> CoreResult<()> {
        self.mutate(|contents| {
            let index = contents
                .entries
                .iter()
                .position(|e| &e.key() == key)
                .ok_or_else(|| CoreError::EntryNotFound {
                    key: key.to_string(),
                })?;
            let mut removed = contents.entries.remove(index);
            removed.zeroize();
            Ok(())
        })
    }

    /// Re-encrypts the database under a new passphrase.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Busy`] while leased, or a storage error if the
    /// write fails. On failure the old passphrase stays in effect.
    pub fn change_passphrase(&self, new_passphrase: Passphrase) -> CoreResult<()> {
        let mut state = self.write_unleased()?;
        let mut contents = state.contents.clone();
        contents.header.touch(&self.host);
        self.store.write(&self.file_id, &new_passphrase, &contents)?;

        state.contents = contents;
        state.passphrase = new_passphrase;
        state.dirty = true;
        let name = self.name();
        debug!(name = %name, "passphrase changed");
        // Still locked: listeners see the edit before a sync can lease the model.
        self.feed.emit(RegistryEvent::Changed { name });
        Ok(())
    }

    /// Tries to take the exclusive sync lease.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Busy`] if the lease is already held and
    /// [`CoreError::Closed`] if the model was closed.
    pub fn try_lease(self: &Arc<Self>) -> CoreResult<ModelLease> {
        // Taken under the state lock so it cannot interleave with a mutation.
        let state = self.state.write();
        if state.closed {
            return Err(CoreError::Closed);
        }
        if self
            .leased
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::busy(self.name()));
        }
        drop(state);

        debug!(name = %self.name(), "lease acquired");
        Ok(ModelLease {
            model: Arc::clone(self),
        })
    }

    /// Wipes secrets and entries. Called by the registry on close.
    pub(crate) fn close(&self) {
        let mut state = self.state.write();
        if state.closed {
            return;
        }
        state.passphrase.zeroize();
        for entry in &mut state.contents.entries {
            entry.zeroize();
        }
        state.contents.entries.clear();
        state.closed = true;
    }

    fn read_open(&self) -> CoreResult<parking_lot::RwLockReadGuard<'_, ModelState>> {
        let state = self.state.read();
        if state.closed {
            return Err(CoreError::Closed);
        }
        Ok(state)
    }

    fn write_unleased(&self) -> CoreResult<parking_lot::RwLockWriteGuard<'_, ModelState>> {
        let state = self.state.write();
        if state.closed {
            return Err(CoreError::Closed);
        }
        if self.is_leased() {
            return Err(CoreError::busy(self.name()));
        }
        Ok(state)
    }

    fn mutate<F>(&self, edit: F) -> CoreResult<()>
    where
        F: FnOnce(&mut DatabaseContents) -> CoreResult<()>,
    {
        let mut state = self.write_unleased()?;
        let mut next = state.contents.clone();
        edit(&mut next)?;
        next.header.touch(&self.host);
        self.store.write(&self.file_id, &state.passphrase, &next)?;

        state.contents = next;
        state.dirty = true;
        let name = self.name();
        debug!(name = %name, "model changed");
        // Still locked: listeners see the edit before a sync can lease the model.
        self.feed.emit(RegistryEvent::Changed { name });
        Ok(())
    }
}

impl std::fmt::Debug for DatabaseModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("DatabaseModel")
            .field("name", &*self.name.read())
            .field("file_id", &self.file_id)
            .field("entries", &state.contents.entries.len())
            .field("dirty", &state.dirty)
            .field("closed", &state.closed)
            .field("leased", &self.is_leased())
            .finish_non_exhaustive()
    }
}

/// Exclusive right to replace a model's contents during sync.
///
/// Released when dropped.
pub struct ModelLease {
    model: Arc<DatabaseModel>,
}

impl ModelLease {
    /// Returns the leased model.
    #[must_use]
    pub fn model(&self) -> &Arc<DatabaseModel> {
        &self.model
    }

    /// Returns the sealed bytes of the backing file as last written.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file cannot be read.
    pub fn sealed_bytes(&self) -> CoreResult<Vec<u8>> {
        let _state = self.model.read_open()?;
        Ok(self.model.store.read_raw(&self.model.file_id)?)
    }

    /// Seals `contents` under the model's passphrase without storing them.
    ///
    /// # Errors
    ///
    /// Returns a storage error if sealing fails.
    pub fn seal(&self, contents: &DatabaseContents) -> CoreResult<Vec<u8>> {
        let state = self.model.read_open()?;
        Ok(self.model.store.encode(&state.passphrase, contents)?)
    }

    /// Opens sealed bytes from elsewhere with the model's passphrase.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WrongPassphrase`] or [`CoreError::CorruptFile`]
    /// if the bytes cannot be opened.
    pub fn unseal(&self, bytes: &[u8]) -> CoreResult<DatabaseContents> {
        let state = self.model.read_open()?;
        Ok(self.model.store.decode(bytes, &state.passphrase)?)
    }

    /// Writes `contents` through and replaces the model's contents in place.
    ///
    /// The model is clean afterwards and no [`RegistryEvent::Changed`] is
    /// emitted.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails; the model is then unchanged.
    pub fn replace_contents(&self, contents: DatabaseContents) -> CoreResult<()> {
        let mut state = self.model.state.write();
        if state.closed {
            return Err(CoreError::Closed);
        }
        self.model
            .store
            .write(&self.model.file_id, &state.passphrase, &contents)?;

        let mut previous = std::mem::replace(&mut state.contents, contents);
        for entry in &mut previous.entries {
            entry.zeroize();
        }
        state.dirty = false;
        debug!(name = %self.model.name(), "contents replaced");
        Ok(())
    }

    /// Clears the dirty flag after the current contents were synced.
    pub fn mark_clean(&self) {
        self.model.state.write().dirty = false;
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.model.leased.store(false, Ordering::SeqCst);
        debug!(name = %self.model.name(), "lease released");
    }
}

impl std::fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLease")
            .field("name", &self.model.name())
            .finish()
    }
}
