//! Store contract definition.

use crate::context::Context;
use crate::error::{StorageError, StorageResult};
use std::io::{Read, Write};
use std::ops::Bound;

/// A byte source for one stored value.
pub type BlobReader = Box<dyn Read + Send>;

/// A lazy sequence of keys. Each item is either a key or the error that
/// stopped enumeration; no items follow an error.
pub type KeyIter<'a> = Box<dyn Iterator<Item = StorageResult<String>> + Send + 'a>;

/// A commit-on-close byte sink for one value.
///
/// Bytes written are not visible under the key until [`commit`](Self::commit)
/// succeeds. Dropping a writer without committing discards everything
/// written to it.
pub trait BlobWriter: Write + Send {
    /// Publishes the written bytes under the writer's key.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Cancelled`] without publishing anything if the
    /// writer's context was cancelled, or the backend's I/O error.
    fn commit(self: Box<Self>) -> StorageResult<()>;
}

/// A named, key-addressed collection of byte values.
///
/// Stores are **opaque byte stores**: they never interpret the values they
/// hold. Keys are non-empty strings, unique per store.
///
/// # Invariants
///
/// - `reader` returns `Ok(None)` for an absent key; absence is not an error
/// - `delete` of an absent key succeeds
/// - a value becomes visible only when its writer commits
/// - a writer whose context is cancelled before commit publishes nothing
/// - no backend offers multi-key transactions; see [`crate::Repository`]
///
/// # Implementors
///
/// - [`crate::MemoryStore`] - For testing and ephemeral caches
/// - [`crate::FlatFileStore`] - One file per key in a single directory
/// - [`crate::ContentAddressedStore`] - Deduplicating, SHA-512 addressed
/// - [`crate::LsmStore`] - LSM-tree backed with periodic sync
/// - [`crate::EncryptedStore`] - Wrapper adding per-value AES-256-GCM
pub trait Store: Send + Sync {
    /// Returns the store's identity.
    fn name(&self) -> &str;

    /// Enumerates keys matching `opts`.
    ///
    /// Ordering is ascending for ordered backends and unspecified for
    /// [`crate::FlatFileStore`].
    ///
    /// # Errors
    ///
    /// Returns an error if enumeration cannot start. Errors during
    /// enumeration are yielded by the iterator.
    fn list<'a>(&'a self, ctx: &Context, opts: &ListOptions) -> StorageResult<KeyIter<'a>>;

    /// Returns true if a value is stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    fn exists(&self, ctx: &Context, key: &str) -> StorageResult<bool>;

    /// Removes the value stored under `key`. Removing an absent key succeeds.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    fn delete(&self, ctx: &Context, key: &str) -> StorageResult<()>;

    /// Opens the value stored under `key`, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    fn reader(&self, ctx: &Context, key: &str) -> StorageResult<Option<BlobReader>>;

    /// Opens a writer that replaces the value under `key` on commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the writer cannot be created.
    fn writer<'a>(&'a self, ctx: &Context, key: &str) -> StorageResult<Box<dyn BlobWriter + 'a>>;

    /// Checks whether [`writer`](Self::writer) would accept `key`, without
    /// touching storage.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] for a key this store can't hold.
    fn check_key(&self, key: &str) -> StorageResult<()> {
        validate_key(key)
    }

    /// Forces everything written so far to durable storage.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Reads a whole value into memory.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    fn get(&self, ctx: &Context, key: &str) -> StorageResult<Option<Vec<u8>>> {
        match self.reader(ctx, key)? {
            Some(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                Ok(Some(buf))
            }
            None => Ok(None),
        }
    }

    /// Writes and commits a whole value.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    fn put(&self, ctx: &Context, key: &str, data: &[u8]) -> StorageResult<()> {
        let mut writer = self.writer(ctx, key)?;
        writer.write_all(data)?;
        writer.commit()
    }
}

/// Restricts which keys [`Store::list`] yields.
///
/// A prefix and an inclusive `[min_key, max_key]` range may be combined;
/// a key must satisfy all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Only keys starting with this prefix.
    pub prefix: Option<String>,
    /// Only keys greater than or equal to this key.
    pub min_key: Option<String>,
    /// Only keys less than or equal to this key.
    pub max_key: Option<String>,
}

impl ListOptions {
    /// Creates options matching every key.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to keys with the given prefix.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Sets the inclusive lower bound.
    #[must_use]
    pub fn min_key(mut self, key: impl Into<String>) -> Self {
        self.min_key = Some(key.into());
        self
    }

    /// Sets the inclusive upper bound.
    #[must_use]
    pub fn max_key(mut self, key: impl Into<String>) -> Self {
        self.max_key = Some(key.into());
        self
    }

    /// Returns true if `key` satisfies every restriction.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        if let Some(prefix) = &self.prefix {
            if !key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(min) = &self.min_key {
            if key < min.as_str() {
                return false;
            }
        }
        if let Some(max) = &self.max_key {
            if key > max.as_str() {
                return false;
            }
        }
        true
    }

    /// Returns true if no key at or after `key` (in ascending order) can match.
    #[must_use]
    pub fn is_past_end(&self, key: &str) -> bool {
        if let Some(max) = &self.max_key {
            if key > max.as_str() {
                return true;
            }
        }
        if let Some(prefix) = &self.prefix {
            if key > prefix.as_str() && !key.starts_with(prefix.as_str()) {
                return true;
            }
        }
        false
    }

    /// Returns the lower bound an ordered scan should start from, resuming
    /// strictly after `after` when given.
    #[must_use]
    pub fn start_bound(&self, after: Option<&str>) -> Bound<String> {
        let mut bound: Bound<String> = Bound::Unbounded;
        for candidate in [self.min_key.as_deref(), self.prefix.as_deref()]
            .into_iter()
            .flatten()
        {
            bound = max_bound(bound, Bound::Included(candidate.to_string()));
        }
        if let Some(after) = after {
            bound = max_bound(bound, Bound::Excluded(after.to_string()));
        }
        bound
    }
}

fn max_bound(a: Bound<String>, b: Bound<String>) -> Bound<String> {
    let key = |bound: &Bound<String>| match bound {
        Bound::Included(k) | Bound::Excluded(k) => Some(k.clone()),
        Bound::Unbounded => None,
    };
    match (key(&a), key(&b)) {
        (None, _) => b,
        (_, None) => a,
        (Some(ka), Some(kb)) if ka > kb => a,
        (Some(ka), Some(kb)) if kb > ka => b,
        // Equal keys: the exclusive bound is the stricter one.
        _ => match a {
            Bound::Excluded(_) => a,
            _ => b,
        },
    }
}

/// Rejects keys no store accepts.
///
/// # Errors
///
/// Returns [`StorageError::InvalidKey`] for an empty key.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::invalid_key(key, "key must not be empty"));
    }
    Ok(())
}

/// Default number of keys fetched per page by ordered backends.
pub(crate) const LIST_PAGE_SIZE: usize = 256;

/// A lazy key iterator over an ordered backend.
///
/// Keys are fetched a page at a time through `fetch(after, limit)`, which
/// must return up to `limit` matching keys strictly greater than `after`
/// in ascending order. No backend lock or transaction is held between
/// pages, so concurrent writes may or may not be observed.
pub(crate) struct PagedKeys<F> {
    fetch: F,
    ctx: Context,
    page: std::vec::IntoIter<String>,
    last: Option<String>,
    exhausted: bool,
    done: bool,
    page_size: usize,
}

impl<F> PagedKeys<F>
where
    F: FnMut(Option<&str>, usize) -> StorageResult<Vec<String>>,
{
    pub(crate) fn new(ctx: &Context, fetch: F) -> Self {
        Self {
            fetch,
            ctx: ctx.clone(),
            page: Vec::new().into_iter(),
            last: None,
            exhausted: false,
            done: false,
            page_size: LIST_PAGE_SIZE,
        }
    }
}

impl<F> Iterator for PagedKeys<F>
where
    F: FnMut(Option<&str>, usize) -> StorageResult<Vec<String>>,
{
    type Item = StorageResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Err(err) = self.ctx.check() {
            self.done = true;
            return Some(Err(err));
        }
        if let Some(key) = self.page.next() {
            self.last = Some(key.clone());
            return Some(Ok(key));
        }
        if self.exhausted {
            self.done = true;
            return None;
        }
        match (self.fetch)(self.last.as_deref(), self.page_size) {
            Ok(keys) => {
                if keys.len() < self.page_size {
                    self.exhausted = true;
                }
                self.page = keys.into_iter();
                match self.page.next() {
                    Some(key) => {
                        self.last = Some(key.clone());
                        Some(Ok(key))
                    }
                    None => {
                        self.done = true;
                        None
                    }
                }
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
