//! Database records: header, entries and entry identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;
use zeroize::Zeroize;

/// Returns the current time as unix seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Password-safe file format generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatVersion {
    /// Version 1.x files.
    V1,
    /// Version 2.0 files.
    V2,
    /// Version 3.x files.
    V3,
}

impl Default for FormatVersion {
    fn default() -> Self {
        FormatVersion::V3
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FormatVersion::V1 => "1.x",
            FormatVersion::V2 => "2.0",
            FormatVersion::V3 => "3.x",
        };
        f.write_str(s)
    }
}

/// Database header record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// File format generation.
    pub version: FormatVersion,
    /// Creation time (unix seconds).
    pub created_at: u64,
    /// Host the database was created on.
    pub created_on: String,
    /// Last save time (unix seconds).
    pub last_saved_at: u64,
    /// Host or user that last saved the database.
    pub last_saved_by: String,
}

impl Header {
    /// Creates a header for a database created now on `host`.
    #[must_use]
    pub fn new(version: FormatVersion, host: impl Into<String>) -> Self {
        let host = host.into();
        let now = unix_now();
        Self {
            version,
            created_at: now,
            created_on: host.clone(),
            last_saved_at: now,
            last_saved_by: host,
        }
    }

    /// Stamps the header as saved now by `host`.
    pub fn touch(&mut self, host: &str) {
        self.last_saved_at = unix_now();
        self.last_saved_by = host.to_string();
    }
}

/// Identity of an entry across two copies of a database.
///
/// Entries carrying a UUID are matched by it. Older entries without one are
/// matched by their title and user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryKey {
    /// Immutable identifier.
    Uuid(Uuid),
    /// Title and user pair.
    TitleUser {
        /// Entry title.
        title: String,
        /// Entry user name.
        user: String,
    },
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKey::Uuid(id) => write!(f, "{id}"),
            EntryKey::TitleUser { title, user } => write!(f, "{title} [{user}]"),
        }
    }
}

/// A single password entry.
///
/// String fields can be wiped in place with [`Zeroize`] when a database is closed.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
pub struct Entry {
    /// Immutable identifier, absent on entries from old files.
    #[zeroize(skip)]
    pub uuid: Option<Uuid>,
    /// Title.
    pub title: String,
    /// User name.
    pub user: String,
    /// Password.
    pub password: String,
    /// URL.
    pub url: String,
    /// Free-form notes.
    pub notes: String,
    /// Creation time (unix seconds).
    pub created_at: Option<u64>,
    /// Last access time (unix seconds).
    pub accessed_at: Option<u64>,
    /// Password expiry time (unix seconds).
    pub password_expires_at: Option<u64>,
}

impl Entry {
    /// Creates a new entry with a fresh UUID, created now.
    #[must_use]
    pub fn new(title: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            uuid: Some(Uuid::new_v4()),
            title: title.into(),
            user: user.into(),
            password: password.into(),
            created_at: Some(unix_now()),
            ..Self::default()
        }
    }

    /// Sets the URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Sets the notes.
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    /// Returns the identity used to match this entry across databases.
    #[must_use]
    pub fn key(&self) -> EntryKey {
        match self.uuid {
            Some(id) => EntryKey::Uuid(id),
            None => EntryKey::TitleUser {
                title: self.title.clone(),
                user: self.user.clone(),
            },
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("uuid", &self.uuid)
            .field("title", &self.title)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// The full contents of one database: header plus ordered entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseContents {
    /// Header record.
    pub header: Header,
    /// Entries in file order.
    pub entries: Vec<Entry>,
}

impl DatabaseContents {
    /// Creates an empty current-format database created on `host`.
    #[must_use]
    pub fn empty(host: impl Into<String>) -> Self {
        Self {
            header: Header::new(FormatVersion::default(), host),
            entries: Vec::new(),
        }
    }
}
