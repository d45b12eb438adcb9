//! Passphrase secret type.

use zeroize::{Zeroize, ZeroizeOnDrop};

/// A database passphrase.
///
/// The bytes are zeroized when dropped and never printed by `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Passphrase {
    bytes: Vec<u8>,
}

impl Passphrase {
    /// Wraps a passphrase.
    #[must_use]
    pub fn new(passphrase: impl AsRef<str>) -> Self {
        Self {
            bytes: passphrase.as_ref().as_bytes().to_vec(),
        }
    }

    /// Returns the raw passphrase bytes.
    ///
    /// # Security
    ///
    /// Don't log or persist the result.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }

    /// Compares two passphrases without short-circuiting on the first difference.
    #[must_use]
    pub fn matches(&self, other: &Passphrase) -> bool {
        if self.bytes.len() != other.bytes.len() {
            return false;
        }
        self.bytes
            .iter()
            .zip(&other.bytes)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Passphrase")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}
