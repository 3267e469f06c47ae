//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The operation's context was cancelled or its deadline passed.
    #[error("operation cancelled")]
    Cancelled,

    /// The key cannot be stored by this backend.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Why the key was rejected.
        reason: String,
    },

    /// The store name is not acceptable as a store identity.
    #[error("invalid store name {name:?}: {reason}")]
    InvalidStoreName {
        /// The rejected name.
        name: String,
        /// Why the name was rejected.
        reason: String,
    },

    /// Persistent state does not match what the store expects.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Encryption or decryption failed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// An encrypted value names an algorithm this build does not know.
    #[error("unknown encryption algorithm byte: {0:#04x}")]
    UnknownAlgorithm(u8),

    /// The registry root is held by another process.
    #[error("store root locked: another process has exclusive access")]
    Locked,

    /// Error from the content-addressed index database.
    #[error("index error: {0}")]
    Index(String),

    /// Error from the LSM engine.
    #[error("lsm error: {0}")]
    Lsm(#[from] fjall::Error),
}

impl StorageError {
    /// Creates an invalid key error.
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid store name error.
    pub fn invalid_store_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidStoreName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Creates an encryption error.
    pub fn encryption(message: impl Into<String>) -> Self {
        Self::Encryption(message.into())
    }

    /// Returns true if this error is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

macro_rules! index_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StorageError {
                fn from(err: $ty) -> Self {
                    Self::Index(err.to_string())
                }
            }
        )*
    };
}

index_error_from!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
