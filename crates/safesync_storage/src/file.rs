//! Directory-based blob backend for persistent storage.

use crate::backend::{validate_id, BlobBackend};
use crate::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Suffix of the scratch file used for atomic replacement.
const TEMP_SUFFIX: &str = ".tmp";

/// A blob backend that keeps one file per blob in a directory.
///
/// # Durability
///
/// `put` writes to `<id>.tmp`, calls `File::sync_all()`, then renames the
/// temp file over `<id>`. A crash leaves either the old or the new file.
///
/// # Example
///
/// ```no_run
/// use safesync_storage::{BlobBackend, FileBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("Documents")).unwrap();
/// backend.put("personal.psafe3", b"sealed bytes").unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    /// Serializes writers so two puts never share a temp file.
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Opens a backend rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or is not a directory.
    pub fn open(root: &Path) -> StoreResult<Self> {
        fs::create_dir_all(root)?;
        if !root.is_dir() {
            return Err(StoreError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("not a directory: {}", root.display()),
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the directory holding the blobs.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path a blob is stored at.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidId`] for identifiers that are not plain file names.
    pub fn path_for(&self, id: &str) -> StoreResult<PathBuf> {
        validate_id(id)?;
        Ok(self.root.join(id))
    }
}

impl BlobBackend for FileBackend {
    fn get(&self, id: &str) -> StoreResult<Vec<u8>> {
        let path = self.path_for(id)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::not_found(id)),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, id: &str, data: &[u8]) -> StoreResult<()> {
        let path = self.path_for(id)?;
        let temp = self.root.join(format!("{id}{TEMP_SUFFIX}"));

        let _guard = self.write_lock.lock();
        let result = (|| -> StoreResult<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp)?;
            file.write_all(data)?;
            file.sync_all()?;
            fs::rename(&temp, &path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&temp);
        } else if let Ok(dir) = File::open(&self.root) {
            // Persist the rename itself; not supported on every platform.
            let _ = dir.sync_all();
        }
        result
    }

    fn delete(&self, id: &str) -> StoreResult<()> {
        let path = self.path_for(id)?;
        let _guard = self.write_lock.lock();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::not_found(id)),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, id: &str) -> StoreResult<bool> {
        Ok(self.path_for(id)?.is_file())
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        let mut ids = Vec::new();
        for dirent in fs::read_dir(&self.root)? {
            let dirent = dirent?;
            if !dirent.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = dirent.file_name().to_str() {
                if !name.ends_with(TEMP_SUFFIX) {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
