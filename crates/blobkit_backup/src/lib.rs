//! # BlobKit Backup
//!
//! Full-system export and import of BlobKit stores.
//!
//! [`BackupEngine`] walks every file store and entity store of a
//! [`StoreProvider`](blobkit_storage::StoreProvider) and streams them into a
//! single zip archive with a SHA-256 verified manifest (`index.json`).
//! Restoring validates the whole archive before touching any store.
//!
//! ## Guarantees
//!
//! - Authorization is checked before any I/O
//! - Backups take no global lock; a backup of a live system is a fuzzy
//!   snapshot
//! - Restore is all-or-nothing up to the start of destructive apply; see
//!   [`BackupError::PartialRestore`] for what happens after
//!
//! ## Example
//!
//! ```rust
//! use blobkit_backup::{BackupEngine, Permission, Subject};
//! use blobkit_storage::{Context, RegistryConfig, Store, StoreProvider, StoreRegistry};
//! use std::io::Cursor;
//! use std::sync::Arc;
//!
//! struct Admin;
//!
//! impl Subject for Admin {
//!     fn describe(&self) -> String {
//!         "admin".to_string()
//!     }
//!
//!     fn is_allowed(&self, _: Permission) -> bool {
//!         true
//!     }
//! }
//!
//! let registry = Arc::new(StoreRegistry::open(RegistryConfig::in_memory()).unwrap());
//! let ctx = Context::background();
//! registry.entity_store("users").unwrap().put(&ctx, "x", br#"{"a":"1"}"#).unwrap();
//!
//! let engine = BackupEngine::new(registry.clone());
//! let mut archive = Cursor::new(Vec::new());
//! let summary = engine.backup(&ctx, &Admin, &mut archive).unwrap();
//! assert_eq!(summary.blobs, 1);
//!
//! archive.set_position(0);
//! engine.restore(&ctx, &Admin, archive).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backup;
mod config;
mod engine;
mod error;
mod hashing;
mod manifest;
mod restore;
mod subject;

pub use config::{
    BackupConfig, Compression, RestoreConfig, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_MANIFEST_SIZE,
};
pub use engine::{BackupEngine, BackupSummary, RestoreSummary};
pub use error::{BackupError, BackupResult, ErrorKind};
pub use hashing::{sha256_hex, HashingWriter};
pub use manifest::{
    data_path, BackupIndex, BlobRecord, Stereotype, StoreRecord, DATA_PREFIX, INDEX_NAME,
};
pub use subject::{Permission, Subject};
