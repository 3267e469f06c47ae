//! Test fixtures and registry helpers.
//!
//! Provides throwaway registries, subjects with fixed permissions, and
//! whole-registry snapshots for before/after comparisons.

use blobkit_backup::{BackupEngine, Permission, Subject};
use blobkit_storage::{
    BackendKind, Context, ListOptions, LsmConfig, RegistryConfig, Store, StoreProvider,
    StoreRegistry,
};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// A test registry with automatic cleanup.
pub struct TempRegistry {
    /// The registry instance.
    pub registry: Arc<StoreRegistry>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TempRegistry {
    /// Creates a registry keeping every store in memory.
    pub fn memory() -> Self {
        Self {
            registry: Arc::new(
                StoreRegistry::open(RegistryConfig::in_memory())
                    .expect("Failed to open in-memory registry"),
            ),
            _temp_dir: None,
        }
    }

    /// Creates a disk registry with the default backends (content-addressed
    /// file stores, LSM entity stores) and no background sync.
    pub fn disk() -> Self {
        Self::with_config(|config| config)
    }

    /// Creates a disk registry with the given backends.
    pub fn with_backends(files: BackendKind, entities: BackendKind) -> Self {
        Self::with_config(|config| config.file_backend(files).entity_backend(entities))
    }

    /// Creates a disk registry, letting `f` adjust the configuration.
    pub fn with_config(f: impl FnOnce(RegistryConfig) -> RegistryConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = f(RegistryConfig::new(temp_dir.path().join("root"))
            .lsm(LsmConfig::new().background_sync(false)));
        Self {
            registry: Arc::new(StoreRegistry::open(config).expect("Failed to open registry")),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the registry root if disk-based.
    pub fn path(&self) -> Option<&Path> {
        self._temp_dir.as_ref().map(|_| self.registry.root())
    }

    /// Returns the registry as a provider.
    pub fn provider(&self) -> Arc<dyn StoreProvider> {
        self.registry.clone()
    }

    /// Creates a backup engine over this registry.
    pub fn engine(&self) -> BackupEngine {
        BackupEngine::new(self.provider())
    }
}

impl std::ops::Deref for TempRegistry {
    type Target = StoreRegistry;

    fn deref(&self) -> &Self::Target {
        &self.registry
    }
}

/// A subject holding a fixed set of permissions.
#[derive(Debug, Clone)]
pub struct StaticSubject {
    name: String,
    permissions: HashSet<Permission>,
}

impl StaticSubject {
    /// Creates a subject holding `permissions`.
    pub fn new(name: impl Into<String>, permissions: &[Permission]) -> Self {
        Self {
            name: name.into(),
            permissions: permissions.iter().copied().collect(),
        }
    }

    /// A subject allowed to back up and restore.
    pub fn admin() -> Self {
        Self::new("admin", &[Permission::Backup, Permission::Restore])
    }

    /// A subject allowed nothing.
    pub fn guest() -> Self {
        Self::new("guest", &[])
    }
}

impl Subject for StaticSubject {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn is_allowed(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Every value of every store, keyed by `"files/<name>"` or
/// `"entities/<name>"`, then by key.
pub type Snapshot = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// Reads every value of one store.
pub fn store_contents(store: &dyn Store) -> BTreeMap<String, Vec<u8>> {
    let ctx = Context::background();
    let mut contents = BTreeMap::new();
    for key in store
        .list(&ctx, &ListOptions::new())
        .expect("Failed to list store")
    {
        let key = key.expect("Failed to enumerate key");
        let value = store
            .get(&ctx, &key)
            .expect("Failed to read value")
            .expect("Listed key has no value");
        contents.insert(key, value);
    }
    contents
}

/// Reads every value of every store a provider knows.
pub fn snapshot(provider: &dyn StoreProvider) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for name in provider.file_stores() {
        let name = name.expect("Failed to enumerate file store");
        let store = provider.file_store(&name).expect("Failed to open file store");
        snapshot.insert(format!("files/{name}"), store_contents(store.as_ref()));
    }
    for name in provider.entity_stores() {
        let name = name.expect("Failed to enumerate entity store");
        let store = provider
            .entity_store(&name)
            .expect("Failed to open entity store");
        snapshot.insert(format!("entities/{name}"), store_contents(store.as_ref()));
    }
    snapshot
}

/// Writes `entries` into `store`.
pub fn populate(store: &dyn Store, entries: &[(&str, &[u8])]) {
    let ctx = Context::background();
    for (key, value) in entries {
        store.put(&ctx, key, value).expect("Failed to populate store");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixtures_memory_registry() {
        let temp = TempRegistry::memory();
        assert!(temp.path().is_none());
        populate(temp.file_store("a").unwrap().as_ref(), &[("k", b"v")]);

        let snap = snapshot(temp.registry.as_ref());
        assert_eq!(snap["files/a"]["k"], b"v");
    }

    #[test]
    fn fixtures_disk_registry() {
        let temp = TempRegistry::disk();
        assert!(temp.path().unwrap().join("LOCK").exists());
        populate(temp.entity_store("users").unwrap().as_ref(), &[("u", b"{}")]);
        assert_eq!(snapshot(temp.registry.as_ref()).len(), 1);
    }

    #[test]
    fn fixtures_static_subject() {
        assert!(StaticSubject::admin().is_allowed(Permission::Restore));
        assert!(!StaticSubject::guest().is_allowed(Permission::Backup));
        let backup_only = StaticSubject::new("ops", &[Permission::Backup]);
        assert!(backup_only.is_allowed(Permission::Backup));
        assert!(!backup_only.is_allowed(Permission::Restore));
    }
}
