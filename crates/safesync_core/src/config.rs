//! Registry configuration.

use safesync_storage::FormatVersion;

/// Configuration for a [`DatabaseRegistry`](crate::DatabaseRegistry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Prefix of generated backing file names.
    pub file_prefix: String,

    /// Extension of generated backing file names, including the dot.
    pub file_extension: String,

    /// Host name stamped into database headers on save.
    pub host: String,

    /// Format version written into newly created databases.
    pub format_version: FormatVersion,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            file_prefix: "safe".to_string(),
            file_extension: ".psafe3".to_string(),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            format_version: FormatVersion::V3,
        }
    }
}

impl RegistryConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the generated file name prefix.
    #[must_use]
    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    /// Sets the generated file name extension.
    #[must_use]
    pub fn file_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = extension.into();
        self
    }

    /// Sets the host name recorded in headers.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the format version for new databases.
    #[must_use]
    pub const fn format_version(mut self, version: FormatVersion) -> Self {
        self.format_version = version;
        self
    }
}
