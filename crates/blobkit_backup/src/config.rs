//! Backup and restore configuration.

use std::path::PathBuf;

/// Default copy buffer for staging and applying archives.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default ceiling on the decoded manifest size.
pub const DEFAULT_MAX_MANIFEST_SIZE: u64 = 64 * 1024 * 1024;

/// How archive members are compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Stored as-is.
    Stored,
    /// DEFLATE.
    Deflated,
}

impl Compression {
    pub(crate) fn method(self) -> zip::CompressionMethod {
        match self {
            Self::Stored => zip::CompressionMethod::Stored,
            Self::Deflated => zip::CompressionMethod::Deflated,
        }
    }
}

/// Configuration for producing archives.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Compression for blob members.
    pub blob_compression: Compression,
    /// Compression for `index.json`.
    pub manifest_compression: Compression,
    /// Directory the archive is assembled in before it is copied to the
    /// sink. `None` uses the system temporary directory.
    pub staging_dir: Option<PathBuf>,
    /// Copy buffer size in bytes.
    pub buffer_size: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            blob_compression: Compression::Deflated,
            manifest_compression: Compression::Deflated,
            staging_dir: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl BackupConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the compression for blob members.
    #[must_use]
    pub const fn blob_compression(mut self, compression: Compression) -> Self {
        self.blob_compression = compression;
        self
    }

    /// Sets the compression for the manifest.
    #[must_use]
    pub const fn manifest_compression(mut self, compression: Compression) -> Self {
        self.manifest_compression = compression;
        self
    }

    /// Assembles archives in `dir`.
    #[must_use]
    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// Sets the copy buffer size. Zero is treated as one byte.
    #[must_use]
    pub const fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = if size == 0 { 1 } else { size };
        self
    }
}

/// Configuration for consuming archives.
#[derive(Debug, Clone)]
pub struct RestoreConfig {
    /// Directory for the staged copy of the incoming archive. `None` uses
    /// the system temporary directory.
    pub staging_dir: Option<PathBuf>,
    /// Copy buffer size in bytes.
    pub buffer_size: usize,
    /// Largest `index.json` accepted, in bytes.
    pub max_manifest_size: u64,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            staging_dir: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_manifest_size: DEFAULT_MAX_MANIFEST_SIZE,
        }
    }
}

impl RestoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages uploads in `dir`.
    #[must_use]
    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// Sets the copy buffer size. Zero is treated as one byte.
    #[must_use]
    pub const fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = if size == 0 { 1 } else { size };
        self
    }

    /// Sets the manifest size ceiling.
    #[must_use]
    pub const fn max_manifest_size(mut self, size: u64) -> Self {
        self.max_manifest_size = size;
        self
    }
}
