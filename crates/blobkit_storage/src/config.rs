//! Store configuration.

use crate::encrypted::EncryptionKey;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default interval between background syncs of an LSM store.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Which backend a store is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// [`crate::MemoryStore`], nothing persisted.
    Memory,
    /// [`crate::FlatFileStore`], one file per key.
    FlatFile,
    /// [`crate::ContentAddressedStore`], deduplicating.
    ContentAddressed,
    /// [`crate::LsmStore`], relaxed durability.
    Lsm,
}

impl BackendKind {
    /// Returns the kind's canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::FlatFile => "flat",
            Self::ContentAddressed => "cas",
            Self::Lsm => "lsm",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "flat" => Ok(Self::FlatFile),
            "cas" => Ok(Self::ContentAddressed),
            "lsm" => Ok(Self::Lsm),
            other => Err(format!(
                "unknown backend {other:?} (expected memory, flat, cas or lsm)"
            )),
        }
    }
}

/// Configuration for [`crate::LsmStore`].
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// How often the background ticker persists everything.
    pub sync_interval: Duration,

    /// Whether to run the background ticker at all.
    pub background_sync: bool,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            background_sync: true,
        }
    }
}

impl LsmConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the background sync interval.
    #[must_use]
    pub const fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets whether the background ticker runs.
    #[must_use]
    pub const fn background_sync(mut self, value: bool) -> Self {
        self.background_sync = value;
        self
    }
}

/// Configuration for [`crate::StoreRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Root directory; file stores live under `files/`, entity stores
    /// under `entities/`. Unused when both kinds are in memory.
    pub root: PathBuf,

    /// Backend for file stores (large blobs).
    pub file_backend: BackendKind,

    /// Backend for entity stores (small documents).
    pub entity_backend: BackendKind,

    /// When set, every store is wrapped in [`crate::EncryptedStore`].
    pub encryption_key: Option<Arc<EncryptionKey>>,

    /// Settings for LSM-backed stores.
    pub lsm: LsmConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("blobkit-data"),
            file_backend: BackendKind::ContentAddressed,
            entity_backend: BackendKind::Lsm,
            encryption_key: None,
            lsm: LsmConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Creates a configuration rooted at `root` with default backends.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Creates a configuration keeping every store in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            file_backend: BackendKind::Memory,
            entity_backend: BackendKind::Memory,
            ..Self::default()
        }
    }

    /// Sets the backend for file stores.
    #[must_use]
    pub const fn file_backend(mut self, kind: BackendKind) -> Self {
        self.file_backend = kind;
        self
    }

    /// Sets the backend for entity stores.
    #[must_use]
    pub const fn entity_backend(mut self, kind: BackendKind) -> Self {
        self.entity_backend = kind;
        self
    }

    /// Enables transparent encryption with `key`.
    #[must_use]
    pub fn encryption_key(mut self, key: Arc<EncryptionKey>) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// Sets the LSM store settings.
    #[must_use]
    pub fn lsm(mut self, lsm: LsmConfig) -> Self {
        self.lsm = lsm;
        self
    }

    /// Returns true if neither store kind touches the filesystem.
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.file_backend == BackendKind::Memory && self.entity_backend == BackendKind::Memory
    }
}
