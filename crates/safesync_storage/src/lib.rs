//! # SafeSync Storage
//!
//! Storage collaborators for SafeSync.
//!
//! This crate is the lowest layer of the workspace. It knows how to keep bytes,
//! how to seal a database into bytes, and how to persist small pieces of
//! registry state. It has no notion of friendly names, open handles or sync.
//!
//! ## Layers
//!
//! - [`BlobBackend`] - opaque byte blobs keyed by file identifier
//!   ([`InMemoryBackend`], [`FileBackend`])
//! - [`DatabaseStore`] - reads and writes whole databases under a passphrase
//!   ([`EncryptedStore`] seals them with AES-256-GCM)
//! - [`StateStore`] - durable namespaced key/value state
//!   ([`InMemoryStateStore`], [`FileStateStore`])
//!
//! ## Example
//!
//! ```rust
//! use safesync_storage::{
//!     DatabaseContents, DatabaseStore, EncryptedStore, Entry, InMemoryBackend, Passphrase,
//! };
//!
//! let store = EncryptedStore::new(InMemoryBackend::new());
//! let passphrase = Passphrase::new("correct horse");
//!
//! let mut contents = DatabaseContents::empty("laptop");
//! contents.entries.push(Entry::new("mail", "alice", "hunter2"));
//! store.write("personal.psafe3", &passphrase, &contents).unwrap();
//!
//! let read = store.read("personal.psafe3", &passphrase).unwrap();
//! assert_eq!(read.entries.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod encrypted;
mod error;
mod file;
mod memory;
mod record;
mod secret;
mod state;

pub use backend::BlobBackend;
pub use encrypted::{DatabaseStore, EncryptedStore, KEY_SIZE, MAGIC, NONCE_SIZE, SALT_SIZE};
pub use error::{StoreError, StoreResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use record::{unix_now, DatabaseContents, Entry, EntryKey, FormatVersion, Header};
pub use secret::Passphrase;
pub use state::{FileStateStore, InMemoryStateStore, StateBatch, StateOp, StateStore};
