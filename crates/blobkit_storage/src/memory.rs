//! In-memory store for testing and ephemeral caches.

use crate::context::Context;
use crate::error::StorageResult;
use crate::store::{validate_key, BlobReader, BlobWriter, KeyIter, ListOptions, PagedKeys, Store};
use bytes::{Buf, Bytes};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::{self, Write};

/// An in-memory store.
///
/// This store keeps every value in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral caches that don't need persistence
///
/// Keys are listed in ascending order.
///
/// # Thread Safety
///
/// A single lock orders map mutations. Readers receive a reference-counted
/// handle to the value, so no lock is held while a value is being read.
///
/// # Example
///
/// ```rust
/// use blobkit_storage::{Context, MemoryStore, Store};
///
/// let store = MemoryStore::new("cache");
/// let ctx = Context::background();
/// store.put(&ctx, "greeting", b"hello").unwrap();
/// assert_eq!(store.get(&ctx, "greeting").unwrap().unwrap(), b"hello");
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    name: String,
    entries: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Returns the number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the store holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Removes every value.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    fn fetch_page(&self, opts: &ListOptions, after: Option<&str>, limit: usize) -> Vec<String> {
        let entries = self.entries.read();
        let range = (opts.start_bound(after), std::ops::Bound::Unbounded);
        entries
            .range::<String, _>(range)
            .map(|(key, _)| key)
            .take_while(|key| !opts.is_past_end(key))
            .filter(|key| opts.matches(key))
            .take(limit)
            .cloned()
            .collect()
    }
}

impl Store for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn list<'a>(&'a self, ctx: &Context, opts: &ListOptions) -> StorageResult<KeyIter<'a>> {
        ctx.check()?;
        let opts = opts.clone();
        Ok(Box::new(PagedKeys::new(ctx, move |after: Option<&str>, limit| {
            Ok(self.fetch_page(&opts, after, limit))
        })))
    }

    fn exists(&self, ctx: &Context, key: &str) -> StorageResult<bool> {
        ctx.check()?;
        Ok(self.entries.read().contains_key(key))
    }

    fn delete(&self, ctx: &Context, key: &str) -> StorageResult<()> {
        ctx.check()?;
        self.entries.write().remove(key);
        Ok(())
    }

    fn reader(&self, ctx: &Context, key: &str) -> StorageResult<Option<BlobReader>> {
        ctx.check()?;
        let value = self.entries.read().get(key).cloned();
        Ok(value.map(|bytes| Box::new(bytes.reader()) as BlobReader))
    }

    fn writer<'a>(&'a self, ctx: &Context, key: &str) -> StorageResult<Box<dyn BlobWriter + 'a>> {
        validate_key(key)?;
        ctx.check()?;
        Ok(Box::new(MemoryWriter {
            store: self,
            ctx: ctx.clone(),
            key: key.to_string(),
            buffer: Vec::new(),
        }))
    }
}

struct MemoryWriter<'a> {
    store: &'a MemoryStore,
    ctx: Context,
    key: String,
    buffer: Vec<u8>,
}

impl Write for MemoryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobWriter for MemoryWriter<'_> {
    fn commit(self: Box<Self>) -> StorageResult<()> {
        self.ctx.check()?;
        let this = *self;
        this.store
            .entries
            .write()
            .insert(this.key, Bytes::from(this.buffer));
        Ok(())
    }
}
