//! Cancellable execution context.
//!
//! Every store operation takes a [`Context`]. Cloning a context shares its
//! cancellation state, so a caller can hand a clone to a long-running
//! operation and cancel it from another thread.

use crate::error::{StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

/// A cancellation handle passed to every store operation.
///
/// # Example
///
/// ```rust
/// use blobkit_storage::Context;
///
/// let ctx = Context::background();
/// assert!(ctx.check().is_ok());
///
/// ctx.cancel();
/// assert!(ctx.check().is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Returns a context that is only cancelled explicitly.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Returns a context that expires after `timeout`.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Instant::now().checked_add(timeout),
            }),
        }
    }

    /// Cancels this context and every clone of it.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true if the context was cancelled or its deadline passed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        self.inner
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Returns the deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Fails with [`StorageError::Cancelled`] if the context is done.
    pub fn check(&self) -> StorageResult<()> {
        if self.is_cancelled() {
            Err(StorageError::Cancelled)
        } else {
            Ok(())
        }
    }
}
