//! Registry of named local databases.
//!
//! The registry owns the persistent mapping from friendly name to backing
//! file identifier and the set of currently open models. All mutations run
//! under one lock and are all-or-nothing: the mapping is only changed by a
//! single [`StateBatch`], and files written for a mapping that could not be
//! persisted are removed again.

use crate::config::RegistryConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{EventFeed, RegistryEvent};
use crate::model::DatabaseModel;
use parking_lot::Mutex;
use safesync_storage::{
    DatabaseContents, DatabaseStore, Header, Passphrase, StateBatch, StateStore, StoreError,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State store namespace holding the name → file mapping.
pub const DATABASES_NAMESPACE: &str = "databases";

#[derive(Default)]
struct RegistryInner {
    /// Friendly name → backing file identifier.
    names: BTreeMap<String, String>,
    /// Friendly name → open handle.
    open: HashMap<String, Arc<DatabaseModel>>,
}

impl RegistryInner {
    fn file_id(&self, name: &str) -> CoreResult<String> {
        self.names
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::unknown_name(name))
    }

    fn is_file_mapped(&self, file_id: &str) -> bool {
        self.names.values().any(|f| f == file_id)
    }
}

/// The named collection of local databases.
///
/// # Example
///
/// ```rust
/// use safesync_core::{DatabaseRegistry, RegistryConfig};
/// use safesync_storage::{EncryptedStore, InMemoryBackend, InMemoryStateStore, Passphrase};
/// use std::sync::Arc;
///
/// let registry = DatabaseRegistry::new(
///     Arc::new(EncryptedStore::new(InMemoryBackend::new())),
///     Arc::new(InMemoryStateStore::new()),
///     RegistryConfig::default(),
/// )
/// .unwrap();
///
/// let passphrase = Passphrase::new("correct horse");
/// let model = registry.create("Personal", "personal.psafe3", &passphrase).unwrap();
/// let again = registry.open("Personal", &passphrase).unwrap();
/// assert!(Arc::ptr_eq(&model, &again));
/// ```
pub struct DatabaseRegistry {
    config: RegistryConfig,
    store: Arc<dyn DatabaseStore>,
    state: Arc<dyn StateStore>,
    feed: Arc<EventFeed>,
    inner: Mutex<RegistryInner>,
}

impl DatabaseRegistry {
    /// Loads the registry from persisted state.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted mapping cannot be read.
    pub fn new(
        store: Arc<dyn DatabaseStore>,
        state: Arc<dyn StateStore>,
        config: RegistryConfig,
    ) -> CoreResult<Self> {
        let mut names = BTreeMap::new();
        for (name, value) in state.scan(DATABASES_NAMESPACE)? {
            let file_id = String::from_utf8(value).map_err(|_| {
                CoreError::Storage(StoreError::corrupted(format!(
                    "mapping for {name:?} is not valid UTF-8"
                )))
            })?;
            names.insert(name, file_id);
        }
        info!(databases = names.len(), "registry loaded");

        Ok(Self {
            config,
            store,
            state,
            feed: Arc::new(EventFeed::new()),
            inner: Mutex::new(RegistryInner {
                names,
                open: HashMap::new(),
            }),
        })
    }

    /// Returns the registry configuration.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Returns the event feed shared by the registry and its models.
    #[must_use]
    pub fn events(&self) -> Arc<EventFeed> {
        Arc::clone(&self.feed)
    }

    /// Returns the state store the registry persists into.
    #[must_use]
    pub fn state_store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.state)
    }

    /// Creates a new empty database and opens it.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NameExists`] if the name is registered
    /// - [`CoreError::FileExists`] if the file is mapped or already in the store
    /// - [`CoreError::CreateFailed`] if the file or mapping cannot be written
    pub fn create(
        &self,
        name: &str,
        file_id: &str,
        passphrase: &Passphrase,
    ) -> CoreResult<Arc<DatabaseModel>> {
        validate_name(name)?;
        validate_file_id(file_id)?;
        let mut inner = self.inner.lock();

        if inner.names.contains_key(name) {
            return Err(CoreError::name_exists(name));
        }
        if inner.is_file_mapped(file_id) || self.store.exists(file_id)? {
            return Err(CoreError::file_exists(file_id));
        }

        let contents = DatabaseContents {
            header: Header::new(self.config.format_version, self.config.host.as_str()),
            entries: Vec::new(),
        };
        self.store
            .write(file_id, passphrase, &contents)
            .map_err(|e| CoreError::create_failed(e.to_string()))?;

        if let Err(e) = self.state.put(DATABASES_NAMESPACE, name, file_id.as_bytes()) {
            if let Err(cleanup) = self.store.remove(file_id) {
                warn!(file_id, error = %cleanup, "failed to remove file after create failure");
            }
            return Err(CoreError::create_failed(e.to_string()));
        }

        inner.names.insert(name.to_string(), file_id.to_string());
        let model = self.new_model(name, file_id, contents, passphrase.clone());
        inner.open.insert(name.to_string(), Arc::clone(&model));
        drop(inner);

        info!(name, file_id, "database created");
        self.feed.emit(RegistryEvent::Added {
            name: name.to_string(),
        });
        self.feed.emit(RegistryEvent::Opened {
            name: name.to_string(),
        });
        Ok(model)
    }

    /// Registers an existing backing file under a new name and opens it.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NameExists`] if the name is registered
    /// - [`CoreError::FileExists`] if the file is already mapped
    /// - [`CoreError::WrongPassphrase`] or [`CoreError::CorruptFile`] if the
    ///   file cannot be opened
    pub fn import(
        &self,
        name: &str,
        file_id: &str,
        passphrase: &Passphrase,
    ) -> CoreResult<Arc<DatabaseModel>> {
        validate_name(name)?;
        validate_file_id(file_id)?;
        let mut inner = self.inner.lock();

        if inner.names.contains_key(name) {
            return Err(CoreError::name_exists(name));
        }
        if inner.is_file_mapped(file_id) {
            return Err(CoreError::file_exists(file_id));
        }

        let contents = self.store.read(file_id, passphrase)?;
        self.state
            .put(DATABASES_NAMESPACE, name, file_id.as_bytes())?;

        inner.names.insert(name.to_string(), file_id.to_string());
        let model = self.new_model(name, file_id, contents, passphrase.clone());
        inner.open.insert(name.to_string(), Arc::clone(&model));
        drop(inner);

        info!(name, file_id, "database imported");
        self.feed.emit(RegistryEvent::Added {
            name: name.to_string(),
        });
        self.feed.emit(RegistryEvent::Opened {
            name: name.to_string(),
        });
        Ok(model)
    }

    /// Unlocks a database, or returns the existing handle if it is open.
    ///
    /// # Errors
    ///
    /// - [`CoreError::UnknownName`] if the name is not registered
    /// - [`CoreError::WrongPassphrase`] if the passphrase does not match
    /// - [`CoreError::CorruptFile`] if the file is missing or unreadable
    pub fn open(&self, name: &str, passphrase: &Passphrase) -> CoreResult<Arc<DatabaseModel>> {
        let mut inner = self.inner.lock();
        let file_id = inner.file_id(name)?;

        if let Some(model) = inner.open.get(name) {
            if model.check_passphrase(passphrase) {
                return Ok(Arc::clone(model));
            }
            return Err(CoreError::WrongPassphrase);
        }

        let contents = self.store.read(&file_id, passphrase).map_err(|e| match e {
            StoreError::NotFound { id } => {
                CoreError::corrupt_file(format!("backing file {id:?} is missing"))
            }
            other => CoreError::from(other),
        })?;

        let model = self.new_model(name, &file_id, contents, passphrase.clone());
        inner.open.insert(name.to_string(), Arc::clone(&model));
        drop(inner);

        debug!(name, "database opened");
        self.feed.emit(RegistryEvent::Opened {
            name: name.to_string(),
        });
        Ok(model)
    }

    /// Returns the handle of an already open database.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownName`] or [`CoreError::NotOpen`].
    pub fn get_open(&self, name: &str) -> CoreResult<Arc<DatabaseModel>> {
        let inner = self.inner.lock();
        inner.file_id(name)?;
        inner
            .open
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::not_open(name))
    }

    /// Closes a database and wipes its secrets. Closing a closed or unknown
    /// database does nothing.
    pub fn close(&self, name: &str) {
        let model = self.inner.lock().open.remove(name);
        if let Some(model) = model {
            model.close();
            debug!(name, "database closed");
            self.feed.emit(RegistryEvent::Closed {
                name: name.to_string(),
            });
        }
    }

    /// Closes every open database.
    pub fn close_all(&self) {
        let closed: Vec<_> = self.inner.lock().open.drain().collect();
        for (name, model) in closed {
            model.close();
            self.feed.emit(RegistryEvent::Closed { name });
        }
    }

    /// Changes a database's friendly name.
    ///
    /// # Errors
    ///
    /// - [`CoreError::UnknownName`] if `old` is not registered
    /// - [`CoreError::NameExists`] if `new` is registered
    pub fn rename(&self, old: &str, new: &str) -> CoreResult<()> {
        validate_name(new)?;
        let mut inner = self.inner.lock();
        let file_id = inner.file_id(old)?;
        if inner.names.contains_key(new) {
            return Err(CoreError::name_exists(new));
        }

        let batch = StateBatch::new()
            .delete(DATABASES_NAMESPACE, old)
            .put(DATABASES_NAMESPACE, new, file_id.as_bytes());
        self.state.apply(batch)?;

        inner.names.remove(old);
        inner.names.insert(new.to_string(), file_id);
        if let Some(model) = inner.open.remove(old) {
            model.set_name(new);
            inner.open.insert(new.to_string(), model);
        }
        drop(inner);

        info!(old, new, "database renamed");
        self.feed.emit(RegistryEvent::Renamed {
            old: old.to_string(),
            new: new.to_string(),
        });
        Ok(())
    }

    /// Deletes a database: closes it, removes the mapping and the backing file.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownName`] if the name is not registered, or a
    /// storage error if the mapping cannot be removed.
    pub fn remove(&self, name: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        let file_id = inner.file_id(name)?;

        self.state.delete(DATABASES_NAMESPACE, name)?;
        inner.names.remove(name);
        let model = inner.open.remove(name);
        drop(inner);

        if let Some(model) = model {
            model.close();
            self.feed.emit(RegistryEvent::Closed {
                name: name.to_string(),
            });
        }
        match self.store.remove(&file_id) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(name, file_id = %file_id, error = %e, "backing file not deleted"),
        }

        info!(name, "database removed");
        self.feed.emit(RegistryEvent::Removed {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Copies a database's backing file under a new generated file identifier
    /// and registers it as `new`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::UnknownName`] if `old` is not registered
    /// - [`CoreError::NameExists`] if `new` is registered
    pub fn duplicate(&self, old: &str, new: &str) -> CoreResult<String> {
        validate_name(new)?;
        let mut inner = self.inner.lock();
        let source = inner.file_id(old)?;
        if inner.names.contains_key(new) {
            return Err(CoreError::name_exists(new));
        }

        let file_id = self.unique_file_id_locked(&inner, &self.config.file_prefix)?;
        self.store.copy(&source, &file_id)?;
        if let Err(e) = self.state.put(DATABASES_NAMESPACE, new, file_id.as_bytes()) {
            if let Err(cleanup) = self.store.remove(&file_id) {
                warn!(file_id = %file_id, error = %cleanup, "failed to remove copy");
            }
            return Err(e.into());
        }
        inner.names.insert(new.to_string(), file_id.clone());
        drop(inner);

        info!(old, new, file_id = %file_id, "database duplicated");
        self.feed.emit(RegistryEvent::Added {
            name: new.to_string(),
        });
        Ok(file_id)
    }

    /// Returns all friendly names, sorted.
    #[must_use]
    pub fn friendly_names(&self) -> Vec<String> {
        self.inner.lock().names.keys().cloned().collect()
    }

    /// Returns true if the name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().names.contains_key(name)
    }

    /// Returns true if some name maps to `file_id`.
    #[must_use]
    pub fn is_file_mapped(&self, file_id: &str) -> bool {
        self.inner.lock().is_file_mapped(file_id)
    }

    /// Returns the backing file identifier for a name.
    #[must_use]
    pub fn file_id_for(&self, name: &str) -> Option<String> {
        self.inner.lock().names.get(name).cloned()
    }

    /// Returns true if the database is open.
    #[must_use]
    pub fn is_open(&self, name: &str) -> bool {
        self.inner.lock().open.contains_key(name)
    }

    /// Generates a file identifier that is neither mapped nor present in the
    /// store, of the form `<prefix><n><extension>`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if existence cannot be checked.
    pub fn unique_file_id(&self, prefix: Option<&str>) -> CoreResult<String> {
        let inner = self.inner.lock();
        self.unique_file_id_locked(&inner, prefix.unwrap_or(&self.config.file_prefix))
    }

    fn unique_file_id_locked(&self, inner: &RegistryInner, prefix: &str) -> CoreResult<String> {
        let mut n: u64 = 1;
        loop {
            let candidate = format!("{prefix}{n}{}", self.config.file_extension);
            if !inner.is_file_mapped(&candidate) && !self.store.exists(&candidate)? {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    fn new_model(
        &self,
        name: &str,
        file_id: &str,
        contents: DatabaseContents,
        passphrase: Passphrase,
    ) -> Arc<DatabaseModel> {
        Arc::new(DatabaseModel::new(
            name,
            file_id,
            &self.config.host,
            Arc::clone(&self.store),
            Arc::clone(&self.feed),
            contents,
            passphrase,
        ))
    }
}

impl Drop for DatabaseRegistry {
    fn drop(&mut self) {
        for (_, model) in self.inner.get_mut().open.drain() {
            model.close();
        }
    }
}

impl std::fmt::Debug for DatabaseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DatabaseRegistry")
            .field("databases", &inner.names.len())
            .field("open", &inner.open.len())
            .finish_non_exhaustive()
    }
}

fn validate_name(name: &str) -> CoreResult<()> {
    if name.trim().is_empty() {
        return Err(CoreError::invalid_name(name, "name is empty"));
    }
    if name.chars().any(char::is_control) {
        return Err(CoreError::invalid_name(name, "name contains control characters"));
    }
    // Names double as remote object names.
    if name.contains(['/', '\\']) {
        return Err(CoreError::invalid_name(name, "name contains a path separator"));
    }
    Ok(())
}

fn validate_file_id(file_id: &str) -> CoreResult<()> {
    if file_id.is_empty() || file_id.contains(['/', '\\', '\0']) || file_id == "." || file_id == ".." {
        return Err(CoreError::invalid_name(file_id, "not a plain file name"));
    }
    Ok(())
}
