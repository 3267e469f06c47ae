//! Fault injection for stores and providers.
//!
//! [`FaultyStore`] wraps any store and fails on demand: after a number of
//! successful commits, on every commit, or by truncating what readers see.
//! [`FaultyProvider`] swaps chosen stores of a provider for faulty ones, so
//! backup and restore can be driven into mid-run failures.

use blobkit_storage::{
    BlobReader, BlobWriter, Context, KeyIter, ListOptions, NameIter, StorageError, StorageResult,
    Store, StoreProvider,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

fn simulated(what: &str) -> StorageError {
    StorageError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("simulated failure during {what}"),
    ))
}

/// A store wrapper that can simulate failures.
pub struct FaultyStore {
    inner: Arc<dyn Store>,
    commits_allowed: AtomicUsize,
    commits: AtomicUsize,
    fail_on_commit: AtomicBool,
    truncate_reads: AtomicU64,
    failed: AtomicBool,
}

impl FaultyStore {
    /// Creates a faulty store wrapping `inner`. No faults are armed.
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self {
            inner,
            commits_allowed: AtomicUsize::new(usize::MAX),
            commits: AtomicUsize::new(0),
            fail_on_commit: AtomicBool::new(false),
            truncate_reads: AtomicU64::new(u64::MAX),
            failed: AtomicBool::new(false),
        }
    }

    /// Lets `n` more commits succeed, then fails every later one.
    pub fn fail_after_commits(&self, n: usize) {
        let done = self.commits.load(Ordering::SeqCst);
        self.commits_allowed
            .store(done.saturating_add(n), Ordering::SeqCst);
    }

    /// Sets whether every commit fails.
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    /// Makes readers yield at most `len` bytes.
    pub fn truncate_reads_to(&self, len: u64) {
        self.truncate_reads.store(len, Ordering::SeqCst);
    }

    /// Disarms every fault.
    pub fn reset(&self) {
        self.commits_allowed.store(usize::MAX, Ordering::SeqCst);
        self.fail_on_commit.store(false, Ordering::SeqCst);
        self.truncate_reads.store(u64::MAX, Ordering::SeqCst);
        self.failed.store(false, Ordering::SeqCst);
    }

    /// Returns whether a fault has fired.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Returns the number of successful commits.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn admit_commit(&self) -> StorageResult<()> {
        if self.fail_on_commit.load(Ordering::SeqCst)
            || self.commits.load(Ordering::SeqCst) >= self.commits_allowed.load(Ordering::SeqCst)
        {
            self.failed.store(true, Ordering::SeqCst);
            return Err(simulated("commit"));
        }
        Ok(())
    }
}

impl Store for FaultyStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn list<'a>(&'a self, ctx: &Context, opts: &ListOptions) -> StorageResult<KeyIter<'a>> {
        self.inner.list(ctx, opts)
    }

    fn exists(&self, ctx: &Context, key: &str) -> StorageResult<bool> {
        self.inner.exists(ctx, key)
    }

    fn delete(&self, ctx: &Context, key: &str) -> StorageResult<()> {
        self.inner.delete(ctx, key)
    }

    fn reader(&self, ctx: &Context, key: &str) -> StorageResult<Option<BlobReader>> {
        let limit = self.truncate_reads.load(Ordering::SeqCst);
        Ok(self.inner.reader(ctx, key)?.map(|reader| {
            if limit == u64::MAX {
                reader
            } else {
                Box::new(reader.take(limit)) as BlobReader
            }
        }))
    }

    fn writer<'a>(&'a self, ctx: &Context, key: &str) -> StorageResult<Box<dyn BlobWriter + 'a>> {
        Ok(Box::new(FaultyWriter {
            store: self,
            inner: self.inner.writer(ctx, key)?,
        }))
    }

    fn check_key(&self, key: &str) -> StorageResult<()> {
        self.inner.check_key(key)
    }

    fn sync(&self) -> StorageResult<()> {
        self.inner.sync()
    }
}

struct FaultyWriter<'a> {
    store: &'a FaultyStore,
    inner: Box<dyn BlobWriter + 'a>,
}

impl Write for FaultyWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl BlobWriter for FaultyWriter<'_> {
    fn commit(self: Box<Self>) -> StorageResult<()> {
        // The inner writer is dropped uncommitted on failure.
        self.store.admit_commit()?;
        self.inner.commit()?;
        self.store.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Class {
    File,
    Entity,
}

/// A provider that substitutes [`FaultyStore`]s for chosen stores.
pub struct FaultyProvider {
    inner: Arc<dyn StoreProvider>,
    faulty: Mutex<HashMap<(Class, String), Arc<FaultyStore>>>,
}

impl FaultyProvider {
    /// Wraps `inner`. No store is faulty yet.
    pub fn new(inner: Arc<dyn StoreProvider>) -> Self {
        Self {
            inner,
            faulty: Mutex::new(HashMap::new()),
        }
    }

    /// Makes the file store `name` faulty and returns its fault controls.
    pub fn fault_file_store(&self, name: &str) -> Arc<FaultyStore> {
        self.fault(Class::File, name)
    }

    /// Makes the entity store `name` faulty and returns its fault controls.
    pub fn fault_entity_store(&self, name: &str) -> Arc<FaultyStore> {
        self.fault(Class::Entity, name)
    }

    fn fault(&self, class: Class, name: &str) -> Arc<FaultyStore> {
        let mut faulty = self.faulty.lock();
        faulty
            .entry((class, name.to_string()))
            .or_insert_with(|| {
                let inner = match class {
                    Class::File => self.inner.file_store(name),
                    Class::Entity => self.inner.entity_store(name),
                }
                .expect("Failed to open store to fault");
                Arc::new(FaultyStore::new(inner))
            })
            .clone()
    }

    fn lookup(&self, class: Class, name: &str) -> Option<Arc<dyn Store>> {
        self.faulty
            .lock()
            .get(&(class, name.to_string()))
            .map(|store| store.clone() as Arc<dyn Store>)
    }
}

impl StoreProvider for FaultyProvider {
    fn file_stores(&self) -> NameIter<'_> {
        self.inner.file_stores()
    }

    fn entity_stores(&self) -> NameIter<'_> {
        self.inner.entity_stores()
    }

    fn file_store(&self, name: &str) -> StorageResult<Arc<dyn Store>> {
        match self.lookup(Class::File, name) {
            Some(store) => Ok(store),
            None => self.inner.file_store(name),
        }
    }

    fn entity_store(&self, name: &str) -> StorageResult<Arc<dyn Store>> {
        match self.lookup(Class::Entity, name) {
            Some(store) => Ok(store),
            None => self.inner.entity_store(name),
        }
    }

    fn check_file_key(&self, name: &str, key: &str) -> StorageResult<()> {
        self.inner.check_file_key(name, key)
    }

    fn check_entity_key(&self, name: &str, key: &str) -> StorageResult<()> {
        self.inner.check_entity_key(name, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobkit_storage::MemoryStore;

    #[test]
    fn faulty_fails_after_commits() {
        let store = FaultyStore::new(Arc::new(MemoryStore::new("s")));
        let ctx = Context::background();
        store.fail_after_commits(1);

        store.put(&ctx, "a", b"1").unwrap();
        assert!(store.put(&ctx, "b", b"2").is_err());
        assert!(store.has_failed());
        assert!(!store.exists(&ctx, "b").unwrap());
        assert_eq!(store.commits(), 1);

        store.reset();
        store.put(&ctx, "b", b"2").unwrap();
    }

    #[test]
    fn faulty_fail_on_commit_publishes_nothing() {
        let store = FaultyStore::new(Arc::new(MemoryStore::new("s")));
        let ctx = Context::background();
        store.set_fail_on_commit(true);
        assert!(store.put(&ctx, "a", b"1").is_err());
        assert!(!store.exists(&ctx, "a").unwrap());
    }

    #[test]
    fn faulty_truncates_reads() {
        let store = FaultyStore::new(Arc::new(MemoryStore::new("s")));
        let ctx = Context::background();
        store.put(&ctx, "a", b"hello").unwrap();
        store.truncate_reads_to(2);
        assert_eq!(store.get(&ctx, "a").unwrap().unwrap(), b"he");
    }

    #[test]
    fn faulty_provider_substitutes_stores() {
        let inner = Arc::new(
            blobkit_storage::StoreRegistry::open(blobkit_storage::RegistryConfig::in_memory())
                .unwrap(),
        );
        let provider = FaultyProvider::new(inner);
        let ctx = Context::background();
        let controls = provider.fault_entity_store("users");
        controls.set_fail_on_commit(true);

        let users = provider.entity_store("users").unwrap();
        assert!(users.put(&ctx, "u", b"{}").is_err());
        let files = provider.file_store("users").unwrap();
        files.put(&ctx, "f", b"ok").unwrap();
    }
}
