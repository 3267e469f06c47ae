//! Error types for backup and restore.

use crate::subject::Permission;
use blobkit_storage::StorageError;
use std::io;
use thiserror::Error;

/// Result type for backup and restore operations.
pub type BackupResult<T> = Result<T, BackupError>;

/// Broad classes of failure callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The subject lacked the required permission. Nothing was touched.
    Unauthorized,
    /// Disk, network or sink failure. Never retried by this crate.
    Io,
    /// Archived bytes don't match the manifest. Restore applied nothing.
    Integrity,
    /// Malformed archive, manifest or encrypted value. Fails closed.
    Format,
    /// The operation's context was cancelled.
    Cancelled,
    /// Restore failed while applying a store; that store may be partially
    /// repopulated.
    PartialRestore,
}

/// Errors that can occur during backup and restore.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The subject may not perform the operation.
    #[error("subject {subject:?} lacks the {permission} permission")]
    Unauthorized {
        /// Description of the subject.
        subject: String,
        /// The missing permission.
        permission: Permission,
    },

    /// Store error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Zip container error.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Manifest (de)serialization error.
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    /// The archive or manifest is structurally invalid.
    #[error("invalid backup format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// A manifest entry names a member the archive doesn't contain.
    #[error("blob {id:?} of store {store:?}: archive member {path:?} is missing")]
    MissingMember {
        /// Store the blob belongs to.
        store: String,
        /// Blob id.
        id: String,
        /// Archive path named by the manifest.
        path: String,
    },

    /// An archive member could not be read back.
    #[error("blob {id:?} of store {store:?}: archive member {path:?} is unreadable: {reason}")]
    CorruptMember {
        /// Store the blob belongs to.
        store: String,
        /// Blob id.
        id: String,
        /// Archive path named by the manifest.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// An archived blob id that the destination store cannot hold.
    #[error("blob {id:?} of store {store:?} cannot be restored: {reason}")]
    UnsupportedKey {
        /// Store the blob belongs to.
        store: String,
        /// Blob id.
        id: String,
        /// Why the destination rejects it.
        reason: String,
    },

    /// An archived blob's size or digest differs from the manifest.
    #[error("blob {id:?} of store {store:?}: {field} mismatch (expected {expected}, got {actual})")]
    IntegrityMismatch {
        /// Store the blob belongs to.
        store: String,
        /// Blob id.
        id: String,
        /// `"size"` or `"sha256"`.
        field: &'static str,
        /// Value recorded in the manifest.
        expected: String,
        /// Value computed from the archive.
        actual: String,
    },

    /// Applying a store failed after destructive restore had begun.
    ///
    /// Stores listed in `completed` were fully restored; `store` may hold
    /// any subset of its archived blobs; later stores were not touched.
    #[error("restore of store {store:?} failed partway ({} stores already restored): {source}", .completed.len())]
    PartialRestore {
        /// The store being applied when the failure occurred.
        store: String,
        /// Stores fully restored before the failure.
        completed: Vec<String>,
        /// The underlying failure.
        source: Box<BackupError>,
    },
}

impl BackupError {
    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a size or digest mismatch error.
    pub fn mismatch(
        store: &str,
        id: &str,
        field: &'static str,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::IntegrityMismatch {
            store: store.to_string(),
            id: id.to_string(),
            field,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Classifies the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::Storage(err) => match err {
                StorageError::Cancelled => ErrorKind::Cancelled,
                StorageError::Corrupted(_) | StorageError::Encryption(_) => ErrorKind::Integrity,
                StorageError::UnknownAlgorithm(_)
                | StorageError::InvalidKey { .. }
                | StorageError::InvalidStoreName { .. } => ErrorKind::Format,
                _ => ErrorKind::Io,
            },
            Self::Io(_) => ErrorKind::Io,
            Self::Archive(zip::result::ZipError::Io(_)) => ErrorKind::Io,
            Self::Archive(_)
            | Self::Manifest(_)
            | Self::InvalidFormat { .. }
            | Self::UnsupportedKey { .. } => ErrorKind::Format,
            Self::MissingMember { .. }
            | Self::CorruptMember { .. }
            | Self::IntegrityMismatch { .. } => ErrorKind::Integrity,
            Self::PartialRestore { .. } => ErrorKind::PartialRestore,
        }
    }

    /// Returns true if this error is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}
