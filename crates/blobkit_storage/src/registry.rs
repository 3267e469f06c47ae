//! Store provisioning.
//!
//! [`StoreProvider`] is the interface the backup engine and host
//! applications use to enumerate and obtain stores. [`StoreRegistry`] is
//! the directory-backed implementation:
//!
//! ```text
//! <root>/
//! ├─ LOCK               # Advisory lock for single-process access
//! ├─ files/<name>/      # File stores (large blobs)
//! └─ entities/<name>/   # Entity stores (small documents)
//! ```

use crate::cas::{ContentAddressedStore, GcStats};
use crate::config::{BackendKind, RegistryConfig};
use crate::context::Context;
use crate::encrypted::EncryptedStore;
use crate::error::{StorageError, StorageResult};
use crate::flat::{check_flat_key, FlatFileStore};
use crate::lsm::LsmStore;
use crate::memory::MemoryStore;
use crate::store::{validate_key, Store};
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const LOCK_FILE: &str = "LOCK";
const FILES_DIR: &str = "files";
const ENTITIES_DIR: &str = "entities";

/// Longest accepted store name, in bytes.
pub const MAX_STORE_NAME_LEN: usize = 128;

/// A sequence of store names. Each item is a name or the error that
/// stopped enumeration.
pub type NameIter<'a> = Box<dyn Iterator<Item = StorageResult<String>> + Send + 'a>;

/// Enumerates and opens the stores of a host application.
pub trait StoreProvider: Send + Sync {
    /// Names of every file store (large blobs).
    fn file_stores(&self) -> NameIter<'_>;

    /// Names of every entity store (small documents).
    fn entity_stores(&self) -> NameIter<'_>;

    /// Opens or creates the file store `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the store cannot be opened.
    fn file_store(&self, name: &str) -> StorageResult<Arc<dyn Store>>;

    /// Opens or creates the entity store `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the store cannot be opened.
    fn entity_store(&self, name: &str) -> StorageResult<Arc<dyn Store>>;

    /// Checks whether the file store `name` would accept `key`, without
    /// opening or creating the store.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] for a key the store can't hold.
    fn check_file_key(&self, name: &str, key: &str) -> StorageResult<()> {
        let _ = name;
        validate_key(key)
    }

    /// Checks whether the entity store `name` would accept `key`, without
    /// opening or creating the store.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] for a key the store can't hold.
    fn check_entity_key(&self, name: &str, key: &str) -> StorageResult<()> {
        let _ = name;
        validate_key(key)
    }
}

/// Rejects names that could escape the registry root.
///
/// Accepted names are non-empty, at most [`MAX_STORE_NAME_LEN`] bytes,
/// consist of ASCII letters, digits, `.`, `_` and `-`, and don't start
/// with `.`.
///
/// # Errors
///
/// Returns [`StorageError::InvalidStoreName`] describing the violation.
pub fn validate_store_name(name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::invalid_store_name(name, "name must not be empty"));
    }
    if name.len() > MAX_STORE_NAME_LEN {
        return Err(StorageError::invalid_store_name(
            name,
            format!("name longer than {MAX_STORE_NAME_LEN} bytes"),
        ));
    }
    if name.starts_with('.') {
        return Err(StorageError::invalid_store_name(name, "name must not start with '.'"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(StorageError::invalid_store_name(
            name,
            format!("character {c:?} not allowed"),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreClass {
    File,
    Entity,
}

impl StoreClass {
    const fn dir_name(self) -> &'static str {
        match self {
            Self::File => FILES_DIR,
            Self::Entity => ENTITIES_DIR,
        }
    }
}

#[derive(Clone)]
struct OpenStore {
    store: Arc<dyn Store>,
    cas: Option<Arc<ContentAddressedStore>>,
    lsm: Option<Arc<LsmStore>>,
}

/// A [`StoreProvider`] rooted at a directory.
///
/// Stores are opened lazily on first access with the configured backend,
/// wrapped in [`EncryptedStore`] when a key is configured, and cached for
/// the registry's lifetime. Opening a registry takes an exclusive advisory
/// lock on `<root>/LOCK`; a second registry on the same root fails with
/// [`StorageError::Locked`] until the first is dropped.
pub struct StoreRegistry {
    config: RegistryConfig,
    files: RwLock<BTreeMap<String, OpenStore>>,
    entities: RwLock<BTreeMap<String, OpenStore>>,
    _lock_file: Option<File>,
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("root", &self.config.root)
            .field("file_backend", &self.config.file_backend)
            .field("entity_backend", &self.config.entity_backend)
            .field("encrypted", &self.config.encryption_key.is_some())
            .finish_non_exhaustive()
    }
}

impl StoreRegistry {
    /// Opens a registry.
    ///
    /// # Errors
    ///
    /// - Another process holds the lock (returns [`StorageError::Locked`])
    /// - The root directories cannot be created
    pub fn open(config: RegistryConfig) -> StorageResult<Self> {
        let lock_file = if config.is_in_memory() {
            None
        } else {
            fs::create_dir_all(&config.root)?;
            let lock_file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(config.root.join(LOCK_FILE))?;
            if lock_file.try_lock_exclusive().is_err() {
                return Err(StorageError::Locked);
            }
            for class in [StoreClass::File, StoreClass::Entity] {
                fs::create_dir_all(config.root.join(class.dir_name()))?;
            }
            Some(lock_file)
        };

        info!(
            root = ?config.root,
            file_backend = %config.file_backend,
            entity_backend = %config.entity_backend,
            encrypted = config.encryption_key.is_some(),
            "opened store registry"
        );
        Ok(Self {
            config,
            files: RwLock::new(BTreeMap::new()),
            entities: RwLock::new(BTreeMap::new()),
            _lock_file: lock_file,
        })
    }

    /// Returns the registry's configuration.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Returns the registry root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn backend(&self, class: StoreClass) -> BackendKind {
        match class {
            StoreClass::File => self.config.file_backend,
            StoreClass::Entity => self.config.entity_backend,
        }
    }

    fn cache(&self, class: StoreClass) -> &RwLock<BTreeMap<String, OpenStore>> {
        match class {
            StoreClass::File => &self.files,
            StoreClass::Entity => &self.entities,
        }
    }

    fn store_dir(&self, class: StoreClass, name: &str) -> PathBuf {
        self.config.root.join(class.dir_name()).join(name)
    }

    fn names(&self, class: StoreClass) -> NameIter<'_> {
        if self.backend(class) == BackendKind::Memory {
            let names: Vec<String> = self.cache(class).read().keys().cloned().collect();
            return Box::new(names.into_iter().map(Ok));
        }

        let dir = self.config.root.join(class.dir_name());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => return Box::new(std::iter::once(Err(e.into()))),
        };
        let mut names = Vec::new();
        for entry in entries {
            match entry {
                Ok(entry) => {
                    if !entry.path().is_dir() {
                        continue;
                    }
                    let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                        continue;
                    };
                    if validate_store_name(&name).is_ok() {
                        names.push(Ok(name));
                    }
                }
                Err(e) => {
                    names.push(Err(e.into()));
                    break;
                }
            }
        }
        // Errors sort last so every good name is still yielded before them.
        names.sort_by(|a, b| match (a, b) {
            (Ok(a), Ok(b)) => a.cmp(b),
            (Ok(_), Err(_)) => std::cmp::Ordering::Less,
            (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
            (Err(_), Err(_)) => std::cmp::Ordering::Equal,
        });
        Box::new(names.into_iter())
    }

    fn check_key(&self, class: StoreClass, name: &str, key: &str) -> StorageResult<()> {
        if let Some(open) = self.cache(class).read().get(name) {
            return open.store.check_key(key);
        }
        match self.backend(class) {
            BackendKind::FlatFile => check_flat_key(key),
            BackendKind::Memory | BackendKind::ContentAddressed | BackendKind::Lsm => {
                validate_key(key)
            }
        }
    }

    fn open_store(&self, class: StoreClass, name: &str) -> StorageResult<OpenStore> {
        validate_store_name(name)?;
        if let Some(open) = self.cache(class).read().get(name) {
            return Ok(open.clone());
        }

        let mut cache = self.cache(class).write();
        if let Some(open) = cache.get(name) {
            return Ok(open.clone());
        }

        let dir = self.store_dir(class, name);
        let backend = self.backend(class);
        let mut open = match backend {
            BackendKind::Memory => OpenStore {
                store: Arc::new(MemoryStore::new(name)),
                cas: None,
                lsm: None,
            },
            BackendKind::FlatFile => OpenStore {
                store: Arc::new(FlatFileStore::open(&dir, name)?),
                cas: None,
                lsm: None,
            },
            BackendKind::ContentAddressed => {
                let cas = Arc::new(ContentAddressedStore::open(&dir, name)?);
                OpenStore {
                    store: cas.clone(),
                    cas: Some(cas),
                    lsm: None,
                }
            }
            BackendKind::Lsm => {
                let lsm = Arc::new(LsmStore::open(&dir, name, &self.config.lsm)?);
                OpenStore {
                    store: lsm.clone(),
                    cas: None,
                    lsm: Some(lsm),
                }
            }
        };
        if let Some(key) = &self.config.encryption_key {
            open.store = Arc::new(EncryptedStore::new(open.store, Arc::clone(key)));
        }

        debug!(store = name, class = class.dir_name(), backend = %backend, "opened store");
        cache.insert(name.to_string(), open.clone());
        Ok(open)
    }

    /// Runs garbage collection on every content-addressed store.
    ///
    /// Returns per-store statistics keyed by `"<class>/<name>"`.
    ///
    /// # Errors
    ///
    /// Returns the first enumeration, open or collection error.
    pub fn collect_garbage(&self, ctx: &Context) -> StorageResult<Vec<(String, GcStats)>> {
        let mut results = Vec::new();
        for class in [StoreClass::File, StoreClass::Entity] {
            if self.backend(class) != BackendKind::ContentAddressed {
                continue;
            }
            for name in self.names(class) {
                let name = name?;
                ctx.check()?;
                if let Some(cas) = self.open_store(class, &name)?.cas {
                    let stats = cas.collect_garbage(ctx)?;
                    results.push((format!("{}/{name}", class.dir_name()), stats));
                }
            }
        }
        Ok(results)
    }

    /// Flushes every store opened so far.
    ///
    /// # Errors
    ///
    /// Returns the first store's sync error.
    pub fn sync_all(&self) -> StorageResult<()> {
        for cache in [&self.files, &self.entities] {
            let opened: Vec<OpenStore> = cache.read().values().cloned().collect();
            for open in opened {
                open.store.sync()?;
            }
        }
        Ok(())
    }

    /// Stops every LSM ticker and flushes every store opened so far.
    ///
    /// # Errors
    ///
    /// Returns the first store's error.
    pub fn close(&self) -> StorageResult<()> {
        for cache in [&self.files, &self.entities] {
            let opened: Vec<OpenStore> = cache.read().values().cloned().collect();
            for open in opened {
                match &open.lsm {
                    Some(lsm) => lsm.stop_sync()?,
                    None => open.store.sync()?,
                }
            }
        }
        Ok(())
    }
}

impl StoreProvider for StoreRegistry {
    fn file_stores(&self) -> NameIter<'_> {
        self.names(StoreClass::File)
    }

    fn entity_stores(&self) -> NameIter<'_> {
        self.names(StoreClass::Entity)
    }

    fn file_store(&self, name: &str) -> StorageResult<Arc<dyn Store>> {
        Ok(self.open_store(StoreClass::File, name)?.store)
    }

    fn entity_store(&self, name: &str) -> StorageResult<Arc<dyn Store>> {
        Ok(self.open_store(StoreClass::Entity, name)?.store)
    }

    fn check_file_key(&self, name: &str, key: &str) -> StorageResult<()> {
        self.check_key(StoreClass::File, name, key)
    }

    fn check_entity_key(&self, name: &str, key: &str) -> StorageResult<()> {
        self.check_key(StoreClass::Entity, name, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LsmConfig;
    use crate::encrypted::{detect_header, EncryptionKey};
    use tempfile::tempdir;

    fn disk_config(root: &Path) -> RegistryConfig {
        RegistryConfig::new(root).lsm(LsmConfig::new().background_sync(false))
    }

    fn collect(iter: NameIter<'_>) -> Vec<String> {
        iter.map(|n| n.unwrap()).collect()
    }

    #[test]
    fn registry_store_names_validated() {
        assert!(validate_store_name("users").is_ok());
        assert!(validate_store_name("a.b_c-D9").is_ok());
        assert!(validate_store_name("").is_err());
        assert!(validate_store_name(".hidden").is_err());
        assert!(validate_store_name("..").is_err());
        assert!(validate_store_name("a/b").is_err());
        assert!(validate_store_name("a\\b").is_err());
        assert!(validate_store_name("naïve").is_err());
        assert!(validate_store_name(&"x".repeat(MAX_STORE_NAME_LEN)).is_ok());
        assert!(validate_store_name(&"x".repeat(MAX_STORE_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn registry_opens_lazily_and_caches() {
        let dir = tempdir().unwrap();
        let registry = StoreRegistry::open(disk_config(dir.path())).unwrap();
        let ctx = Context::background();

        assert!(collect(registry.file_stores()).is_empty());
        let a = registry.file_store("avatars").unwrap();
        a.put(&ctx, "x", b"1").unwrap();
        let again = registry.file_store("avatars").unwrap();
        assert_eq!(again.get(&ctx, "x").unwrap().unwrap(), b"1");

        registry.entity_store("users").unwrap();
        registry.entity_store("groups").unwrap();
        assert_eq!(collect(registry.file_stores()), vec!["avatars"]);
        assert_eq!(collect(registry.entity_stores()), vec!["groups", "users"]);
    }

    #[test]
    fn registry_rejects_bad_names() {
        let registry = StoreRegistry::open(RegistryConfig::in_memory()).unwrap();
        assert!(matches!(
            registry.file_store("../escape"),
            Err(StorageError::InvalidStoreName { .. })
        ));
    }

    #[test]
    fn registry_lock_prevents_second_open() {
        let dir = tempdir().unwrap();
        let first = StoreRegistry::open(disk_config(dir.path())).unwrap();
        assert!(matches!(
            StoreRegistry::open(disk_config(dir.path())),
            Err(StorageError::Locked)
        ));
        drop(first);
        assert!(StoreRegistry::open(disk_config(dir.path())).is_ok());
    }

    #[test]
    fn registry_reopen_sees_persisted_stores() {
        let dir = tempdir().unwrap();
        let ctx = Context::background();
        {
            let registry = StoreRegistry::open(disk_config(dir.path())).unwrap();
            registry.entity_store("users").unwrap().put(&ctx, "u1", b"{}").unwrap();
            registry.file_store("docs").unwrap().put(&ctx, "d1", b"pdf").unwrap();
            registry.close().unwrap();
        }
        let registry = StoreRegistry::open(disk_config(dir.path())).unwrap();
        assert_eq!(collect(registry.entity_stores()), vec!["users"]);
        assert_eq!(
            registry.entity_store("users").unwrap().get(&ctx, "u1").unwrap().unwrap(),
            b"{}"
        );
        assert_eq!(
            registry.file_store("docs").unwrap().get(&ctx, "d1").unwrap().unwrap(),
            b"pdf"
        );
    }

    #[test]
    fn registry_wraps_with_encryption() {
        let dir = tempdir().unwrap();
        let ctx = Context::background();
        let key = Arc::new(EncryptionKey::generate());
        let config = disk_config(dir.path())
            .file_backend(BackendKind::FlatFile)
            .encryption_key(key);
        {
            let registry = StoreRegistry::open(config).unwrap();
            registry.file_store("secrets").unwrap().put(&ctx, "k", b"plain").unwrap();
        }

        let raw = FlatFileStore::open(&dir.path().join("files/secrets"), "secrets").unwrap();
        let stored = raw.get(&ctx, "k").unwrap().unwrap();
        assert!(detect_header(&stored).is_some());
    }

    #[test]
    fn registry_memory_mode_lists_opened() {
        let registry = StoreRegistry::open(RegistryConfig::in_memory()).unwrap();
        registry.file_store("b").unwrap();
        registry.file_store("a").unwrap();
        assert_eq!(collect(registry.file_stores()), vec!["a", "b"]);
        assert!(collect(registry.entity_stores()).is_empty());
    }

    #[test]
    fn registry_gc_runs_on_cas_stores() {
        let dir = tempdir().unwrap();
        let ctx = Context::background();
        let registry = StoreRegistry::open(disk_config(dir.path())).unwrap();
        let store = registry.file_store("blobs").unwrap();
        store.put(&ctx, "a", b"shared").unwrap();
        store.put(&ctx, "b", b"shared").unwrap();
        store.delete(&ctx, "a").unwrap();
        store.delete(&ctx, "b").unwrap();

        let results = registry.collect_garbage(&ctx).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "files/blobs");
        assert_eq!(results[0].1.unreferenced_removed, 1);
    }

    #[test]
    fn registry_checks_keys_without_opening() {
        let dir = tempdir().unwrap();
        let config = disk_config(dir.path())
            .file_backend(BackendKind::FlatFile)
            .entity_backend(BackendKind::Lsm);
        let registry = StoreRegistry::open(config).unwrap();
        let long = "k".repeat(200);

        assert!(matches!(
            registry.check_file_key("uploads", &long),
            Err(StorageError::InvalidKey { .. })
        ));
        registry.check_file_key("uploads", "short").unwrap();
        registry.check_entity_key("users", &long).unwrap();
        assert!(registry.check_entity_key("users", "").is_err());
        assert!(collect(registry.file_stores()).is_empty());

        // An opened store answers for itself.
        registry.file_store("uploads").unwrap();
        assert!(registry.check_file_key("uploads", &long).is_err());
    }
}
