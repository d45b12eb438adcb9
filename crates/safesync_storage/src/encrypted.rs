//! Sealed database store.
//!
//! A database is stored as a single sealed blob:
//!
//! ```text
//! magic "SSDB" (4) | format u16 LE (2) | salt (16) | verifier (32) | nonce (12) | ciphertext || tag
//! ```
//!
//! - The key is HKDF-SHA256 over the passphrase with the per-file salt
//! - The verifier is SHA-256 over the key, so a wrong passphrase is reported
//!   as such instead of as corruption
//! - The plaintext is the CBOR encoding of [`DatabaseContents`]
//! - Every write draws a fresh salt and nonce

use crate::backend::BlobBackend;
use crate::error::{StoreError, StoreResult};
use crate::record::DatabaseContents;
use crate::secret::Passphrase;
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Magic bytes at the start of every sealed database.
pub const MAGIC: [u8; 4] = *b"SSDB";
/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;
/// Size of the per-file key derivation salt.
pub const SALT_SIZE: usize = 16;

const SEAL_FORMAT: u16 = 1;
const VERIFIER_SIZE: usize = 32;
const HEADER_SIZE: usize = MAGIC.len() + 2 + SALT_SIZE + VERIFIER_SIZE + NONCE_SIZE;

/// Reads and writes whole databases under a passphrase.
///
/// Every call is atomic: a failed `write` leaves the previous file intact.
pub trait DatabaseStore: Send + Sync {
    /// Reads and decrypts the database stored under `file_id`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if no such file exists
    /// - [`StoreError::WrongPassphrase`] if the passphrase does not match
    /// - [`StoreError::Corrupted`] if the file cannot be decoded
    fn read(&self, file_id: &str, passphrase: &Passphrase) -> StoreResult<DatabaseContents>;

    /// Encrypts and writes the database under `file_id`, replacing any previous file.
    ///
    /// # Errors
    ///
    /// Returns an error if sealing or the underlying write fails.
    fn write(
        &self,
        file_id: &str,
        passphrase: &Passphrase,
        contents: &DatabaseContents,
    ) -> StoreResult<()>;

    /// Returns the sealed bytes stored under `file_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such file exists.
    fn read_raw(&self, file_id: &str) -> StoreResult<Vec<u8>>;

    /// Seals contents into bytes without storing them.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or encryption fails.
    fn encode(&self, passphrase: &Passphrase, contents: &DatabaseContents) -> StoreResult<Vec<u8>>;

    /// Opens sealed bytes obtained elsewhere (for example a remote download).
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read), minus `NotFound`.
    fn decode(&self, bytes: &[u8], passphrase: &Passphrase) -> StoreResult<DatabaseContents>;

    /// Returns true if a file exists under `file_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if existence cannot be determined.
    fn exists(&self, file_id: &str) -> StoreResult<bool>;

    /// Deletes the file under `file_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such file exists.
    fn remove(&self, file_id: &str) -> StoreResult<()>;

    /// Copies the sealed file `from` to `to` byte for byte.
    ///
    /// # Errors
    ///
    /// Returns an error if `from` is missing or the write fails.
    fn copy(&self, from: &str, to: &str) -> StoreResult<()>;
}

/// Symmetric key derived from a passphrase.
///
/// The key is automatically zeroized when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
struct DerivedKey {
    bytes: [u8; KEY_SIZE],
}

impl DerivedKey {
    /// Derives a key from a passphrase using HKDF-SHA256.
    ///
    /// HKDF is not a password hashing function. A deployment holding
    /// low-entropy passphrases should put a slow KDF in front of it.
    fn derive(passphrase: &Passphrase, salt: &[u8]) -> StoreResult<Self> {
        let hk = Hkdf::<Sha256>::new(Some(salt), passphrase.expose());
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(b"safesync-database-key-v1", &mut bytes)
            .map_err(|_| StoreError::Encryption("HKDF expand failed".into()))?;
        Ok(Self { bytes })
    }

    fn verifier(&self) -> [u8; VERIFIER_SIZE] {
        let mut hasher = Sha256::new();
        hasher.update(b"safesync-verifier-v1");
        hasher.update(self.bytes);
        hasher.finalize().into()
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(GenericArray::from_slice(&self.bytes))
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A [`DatabaseStore`] that seals databases with AES-256-GCM into any [`BlobBackend`].
///
/// # Example
///
/// ```rust
/// use safesync_storage::{
///     DatabaseContents, DatabaseStore, EncryptedStore, InMemoryBackend, Passphrase, StoreError,
/// };
///
/// let store = EncryptedStore::new(InMemoryBackend::new());
/// let contents = DatabaseContents::empty("phone");
/// store.write("a.psafe3", &Passphrase::new("right"), &contents).unwrap();
///
/// let wrong = store.read("a.psafe3", &Passphrase::new("wrong"));
/// assert!(matches!(wrong, Err(StoreError::WrongPassphrase)));
/// ```
#[derive(Debug)]
pub struct EncryptedStore<B: BlobBackend> {
    backend: B,
}

impl<B: BlobBackend> EncryptedStore<B> {
    /// Creates a store sealing into `backend`.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn seal(passphrase: &Passphrase, contents: &DatabaseContents) -> StoreResult<Vec<u8>> {
        let mut plaintext = Vec::new();
        ciborium::into_writer(contents, &mut plaintext)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key = DerivedKey::derive(passphrase, &salt)?;
        let ciphertext = key
            .cipher()
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|_| StoreError::Encryption("encryption error".into()));
        plaintext.zeroize();
        let ciphertext = ciphertext?;

        let mut sealed = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        sealed.extend_from_slice(&MAGIC);
        sealed.extend_from_slice(&SEAL_FORMAT.to_le_bytes());
        sealed.extend_from_slice(&salt);
        sealed.extend_from_slice(&key.verifier());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend(ciphertext);
        Ok(sealed)
    }

    fn unseal(sealed: &[u8], passphrase: &Passphrase) -> StoreResult<DatabaseContents> {
        if sealed.len() < HEADER_SIZE + TAG_SIZE {
            return Err(StoreError::corrupted("file too short"));
        }
        if sealed[..MAGIC.len()] != MAGIC {
            return Err(StoreError::corrupted("invalid magic"));
        }

        let mut cursor = MAGIC.len();
        let format = u16::from_le_bytes([sealed[cursor], sealed[cursor + 1]]);
        if format != SEAL_FORMAT {
            return Err(StoreError::corrupted(format!(
                "unsupported seal format {format}"
            )));
        }
        cursor += 2;

        let salt = &sealed[cursor..cursor + SALT_SIZE];
        cursor += SALT_SIZE;
        let verifier = &sealed[cursor..cursor + VERIFIER_SIZE];
        cursor += VERIFIER_SIZE;
        let nonce = Nonce::from_slice(&sealed[cursor..cursor + NONCE_SIZE]);
        cursor += NONCE_SIZE;

        let key = DerivedKey::derive(passphrase, salt)?;
        if key.verifier().as_slice() != verifier {
            return Err(StoreError::WrongPassphrase);
        }

        let mut plaintext = key
            .cipher()
            .decrypt(nonce, &sealed[cursor..])
            .map_err(|_| StoreError::corrupted("authentication failed"))?;

        let contents = ciborium::from_reader(plaintext.as_slice())
            .map_err(|e| StoreError::corrupted(format!("undecodable contents: {e}")));
        plaintext.zeroize();
        contents
    }
}

impl<B: BlobBackend> DatabaseStore for EncryptedStore<B> {
    fn read(&self, file_id: &str, passphrase: &Passphrase) -> StoreResult<DatabaseContents> {
        let sealed = self.backend.get(file_id)?;
        Self::unseal(&sealed, passphrase)
    }

    fn write(
        &self,
        file_id: &str,
        passphrase: &Passphrase,
        contents: &DatabaseContents,
    ) -> StoreResult<()> {
        let sealed = Self::seal(passphrase, contents)?;
        self.backend.put(file_id, &sealed)
    }

    fn read_raw(&self, file_id: &str) -> StoreResult<Vec<u8>> {
        self.backend.get(file_id)
    }

    fn encode(&self, passphrase: &Passphrase, contents: &DatabaseContents) -> StoreResult<Vec<u8>> {
        Self::seal(passphrase, contents)
    }

    fn decode(&self, bytes: &[u8], passphrase: &Passphrase) -> StoreResult<DatabaseContents> {
        Self::unseal(bytes, passphrase)
    }

    fn exists(&self, file_id: &str) -> StoreResult<bool> {
        self.backend.exists(file_id)
    }

    fn remove(&self, file_id: &str) -> StoreResult<()> {
        self.backend.delete(file_id)
    }

    fn copy(&self, from: &str, to: &str) -> StoreResult<()> {
        let sealed = self.backend.get(from)?;
        self.backend.put(to, &sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Entry;
    use crate::InMemoryBackend;

    fn sample() -> DatabaseContents {
        let mut contents = DatabaseContents::empty("test-host");
        contents.entries.push(Entry::new("mail", "alice", "hunter2"));
        contents.entries.push(Entry::new("bank", "alice", "1234"));
        contents
    }

    #[test]
    fn write_read_roundtrip() {
        let store = EncryptedStore::new(InMemoryBackend::new());
        let pass = Passphrase::new("pw");
        let contents = sample();

        store.write("db", &pass, &contents).unwrap();
        assert_eq!(store.read("db", &pass).unwrap(), contents);
    }

    #[test]
    fn sealed_bytes_hide_plaintext() {
        let store = EncryptedStore::new(InMemoryBackend::new());
        store.write("db", &Passphrase::new("pw"), &sample()).unwrap();

        let raw = store.read_raw("db").unwrap();
        assert_eq!(&raw[..4], b"SSDB");
        assert!(!raw.windows(7).any(|w| w == b"hunter2"));
    }

    #[test]
    fn each_write_uses_fresh_nonce() {
        let store = EncryptedStore::new(InMemoryBackend::new());
        let pass = Passphrase::new("pw");
        let contents = sample();

        let a = store.encode(&pass, &contents).unwrap();
        let b = store.encode(&pass, &contents).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_passphrase_detected() {
        let store = EncryptedStore::new(InMemoryBackend::new());
        store.write("db", &Passphrase::new("right"), &sample()).unwrap();

        let result = store.read("db", &Passphrase::new("wrong"));
        assert!(matches!(result, Err(StoreError::WrongPassphrase)));
    }

    #[test]
    fn tampered_ciphertext_is_corrupt() {
        let store = EncryptedStore::new(InMemoryBackend::new());
        let pass = Passphrase::new("pw");
        let mut sealed = store.encode(&pass, &sample()).unwrap();

        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;

        assert!(matches!(
            store.decode(&sealed, &pass),
            Err(StoreError::Corrupted(_))
        ));
    }

    #[test]
    fn garbage_is_corrupt() {
        let store = EncryptedStore::new(InMemoryBackend::new());
        let pass = Passphrase::new("pw");

        assert!(matches!(
            store.decode(b"short", &pass),
            Err(StoreError::Corrupted(_))
        ));
        assert!(matches!(
            store.decode(&[0u8; 128], &pass),
            Err(StoreError::Corrupted(_))
        ));
    }

    #[test]
    fn copy_is_byte_identical() {
        let store = EncryptedStore::new(InMemoryBackend::new());
        store.write("a", &Passphrase::new("pw"), &sample()).unwrap();

        store.copy("a", "b").unwrap();
        assert_eq!(store.read_raw("a").unwrap(), store.read_raw("b").unwrap());
    }

    #[test]
    fn failed_write_keeps_previous_file() {
        let store = EncryptedStore::new(InMemoryBackend::new());
        let pass = Passphrase::new("pw");
        let original = sample();
        store.write("db", &pass, &original).unwrap();

        store.backend().fail_writes(true);
        assert!(store.write("db", &pass, &DatabaseContents::empty("x")).is_err());
        store.backend().fail_writes(false);

        assert_eq!(store.read("db", &pass).unwrap(), original);
    }
}
