//! The backup engine and its run summaries.

use crate::config::{BackupConfig, RestoreConfig};
use crate::error::BackupResult;
use crate::manifest::Stereotype;
use blobkit_storage::{NameIter, StorageResult, Store, StoreProvider};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Exports every store of a [`StoreProvider`] to a zip archive and
/// restores them from one.
///
/// See [`backup`](Self::backup), [`restore`](Self::restore) and
/// [`inspect`](Self::inspect).
pub struct BackupEngine {
    pub(crate) provider: Arc<dyn StoreProvider>,
    pub(crate) backup_config: BackupConfig,
    pub(crate) restore_config: RestoreConfig,
}

impl std::fmt::Debug for BackupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupEngine")
            .field("backup_config", &self.backup_config)
            .field("restore_config", &self.restore_config)
            .finish_non_exhaustive()
    }
}

impl BackupEngine {
    /// Creates an engine over `provider` with default configuration.
    #[must_use]
    pub fn new(provider: Arc<dyn StoreProvider>) -> Self {
        Self {
            provider,
            backup_config: BackupConfig::default(),
            restore_config: RestoreConfig::default(),
        }
    }

    /// Replaces the backup configuration.
    #[must_use]
    pub fn with_backup_config(mut self, config: BackupConfig) -> Self {
        self.backup_config = config;
        self
    }

    /// Replaces the restore configuration.
    #[must_use]
    pub fn with_restore_config(mut self, config: RestoreConfig) -> Self {
        self.restore_config = config;
        self
    }

    /// Returns the store provider.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn StoreProvider> {
        &self.provider
    }

    pub(crate) fn store_names(&self, stereotype: Stereotype) -> NameIter<'_> {
        match stereotype {
            Stereotype::Blob => self.provider.file_stores(),
            Stereotype::Document => self.provider.entity_stores(),
        }
    }

    /// Checks that `key` can be written to the named store without
    /// opening or creating it.
    pub(crate) fn check_key(
        &self,
        stereotype: Stereotype,
        name: &str,
        key: &str,
    ) -> StorageResult<()> {
        match stereotype {
            Stereotype::Blob => self.provider.check_file_key(name, key),
            Stereotype::Document => self.provider.check_entity_key(name, key),
        }
    }

    pub(crate) fn open_store(
        &self,
        stereotype: Stereotype,
        name: &str,
    ) -> BackupResult<Arc<dyn Store>> {
        let store = match stereotype {
            Stereotype::Blob => self.provider.file_store(name)?,
            Stereotype::Document => self.provider.entity_store(name)?,
        };
        Ok(store)
    }
}

/// Outcome of a successful backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    /// The manifest's creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Stores archived.
    pub stores: usize,
    /// Values archived.
    pub blobs: usize,
    /// Bytes archived, before compression.
    pub bytes: u64,
    /// Keys that vanished between listing and reading.
    pub skipped: usize,
}

/// Outcome of a successful restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    /// The restored manifest's creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Stores replaced.
    pub stores: usize,
    /// Values written.
    pub blobs: usize,
    /// Bytes written.
    pub bytes: u64,
    /// Pre-existing entries deleted from the replaced stores.
    pub deleted: usize,
}
