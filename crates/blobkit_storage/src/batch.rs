//! Read views, write batches and the repository mutex.
//!
//! None of the backends offer multi-key transactions. The types here give
//! callers a transaction-shaped API without pretending otherwise:
//!
//! - [`ReadView`] reads live data; it is **not** a snapshot.
//! - [`WriteBatch`] applies operations one at a time; it is **not** atomic.
//! - [`Repository`] serializes read-then-write sequences through its own
//!   mutex. It only excludes other callers using the same repository.

use crate::context::Context;
use crate::error::{StorageError, StorageResult};
use crate::store::{ListOptions, Store};
use parking_lot::Mutex;
use std::sync::Arc;

/// A read-only view over a store.
///
/// Each call observes whatever is committed at that moment. Two reads
/// through the same view may see different states of the store.
#[derive(Clone, Copy)]
pub struct ReadView<'a> {
    store: &'a dyn Store,
    ctx: &'a Context,
}

impl<'a> ReadView<'a> {
    /// Creates a view over `store` bound to `ctx`.
    #[must_use]
    pub fn new(store: &'a dyn Store, ctx: &'a Context) -> Self {
        Self { store, ctx }
    }

    /// Reads a whole value.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.store.get(self.ctx, key)
    }

    /// Returns true if `key` is present.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn exists(&self, key: &str) -> StorageResult<bool> {
        self.store.exists(self.ctx, key)
    }

    /// Collects every key matching `opts`.
    ///
    /// # Errors
    ///
    /// Returns the first enumeration error.
    pub fn keys(&self, opts: &ListOptions) -> StorageResult<Vec<String>> {
        self.store.list(self.ctx, opts)?.collect()
    }
}

/// One queued operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Replace the value under `key`.
    Put {
        /// Target key.
        key: String,
        /// New value.
        value: Vec<u8>,
    },
    /// Remove `key`.
    Delete {
        /// Target key.
        key: String,
    },
}

impl BatchOp {
    /// Returns the key this operation touches.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Why a batch stopped early.
#[derive(Debug)]
pub struct BatchError {
    /// Operations applied before the failure. They stay applied.
    pub applied: usize,
    /// The failing operation's error.
    pub source: StorageError,
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "write batch failed after {} applied operations: {}",
            self.applied, self.source
        )
    }
}

impl std::error::Error for BatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// An ordered list of puts and deletes.
///
/// [`apply`](Self::apply) runs the operations in insertion order. A failure
/// leaves every earlier operation applied; the error reports how many.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a put.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Queues a delete.
    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    /// Returns the queued operations.
    #[must_use]
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Returns the number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Applies every operation to `store` in order.
    ///
    /// Returns the number of operations applied.
    ///
    /// # Errors
    ///
    /// Returns a [`BatchError`] at the first failing operation.
    pub fn apply(&self, ctx: &Context, store: &dyn Store) -> Result<usize, BatchError> {
        for (applied, op) in self.ops.iter().enumerate() {
            let result = ctx.check().and_then(|()| match op {
                BatchOp::Put { key, value } => store.put(ctx, key, value),
                BatchOp::Delete { key } => store.delete(ctx, key),
            });
            if let Err(source) = result {
                return Err(BatchError { applied, source });
            }
        }
        Ok(self.ops.len())
    }
}

/// A store guarded by an explicit mutex for read-then-write sequences.
///
/// Every method takes the repository's own lock, so two callers going
/// through the same `Repository` never interleave an
/// [`update`](Self::update). Writers that bypass the repository and use the
/// store directly are not excluded.
pub struct Repository {
    store: Arc<dyn Store>,
    lock: Mutex<()>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("store", &self.store.name())
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Creates a repository over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Reads a value, translating absence into an empty value.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn get_or_default(&self, ctx: &Context, key: &str) -> StorageResult<Vec<u8>> {
        let _guard = self.lock.lock();
        Ok(self.store.get(ctx, key)?.unwrap_or_default())
    }

    /// Writes a value under the repository lock.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn put(&self, ctx: &Context, key: &str, value: &[u8]) -> StorageResult<()> {
        let _guard = self.lock.lock();
        self.store.put(ctx, key, value)
    }

    /// Reads `key`, passes the current value to `f` and stores the result.
    ///
    /// `f` returning `None` deletes the key. The new value (if any) is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns `f`'s error without writing anything, or the backend's error.
    pub fn update<F>(&self, ctx: &Context, key: &str, f: F) -> StorageResult<Option<Vec<u8>>>
    where
        F: FnOnce(Option<Vec<u8>>) -> StorageResult<Option<Vec<u8>>>,
    {
        let _guard = self.lock.lock();
        let current = self.store.get(ctx, key)?;
        let next = f(current)?;
        match &next {
            Some(value) => self.store.put(ctx, key, value)?,
            None => self.store.delete(ctx, key)?,
        }
        Ok(next)
    }
}
