//! # BlobKit Storage
//!
//! Key/value blob store contract and backends.
//!
//! Every backend implements [`Store`]: a named collection of opaque byte
//! values addressed by non-empty string keys. Callers hold an
//! `Arc<dyn Store>` and never depend on a concrete backend.
//!
//! ## Design Principles
//!
//! - Absence is not an error: readers for missing keys are `None`, deleting
//!   a missing key succeeds
//! - Writes are commit-on-close; a cancelled writer publishes nothing
//! - No backend offers multi-key transactions ([`Repository`] serializes
//!   read-then-write sequences explicitly)
//! - Every operation takes a cancellable [`Context`]
//!
//! ## Available Backends
//!
//! - [`MemoryStore`] - For testing and ephemeral caches
//! - [`FlatFileStore`] - One hex-named file per key, atomic rename on commit
//! - [`ContentAddressedStore`] - SHA-512 addressed, deduplicating, redb index
//! - [`LsmStore`] - fjall LSM tree with periodic background sync
//! - [`EncryptedStore`] - Wrapper that adds AES-256-GCM encryption
//!
//! ## Example
//!
//! ```rust
//! use blobkit_storage::{Context, MemoryStore, Store};
//!
//! let store = MemoryStore::new("cache");
//! let ctx = Context::background();
//! store.put(&ctx, "greeting", b"hello world").unwrap();
//! assert_eq!(store.get(&ctx, "greeting").unwrap().unwrap(), b"hello world");
//! assert!(store.get(&ctx, "missing").unwrap().is_none());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod cas;
mod config;
mod context;
mod encrypted;
mod error;
mod flat;
mod lsm;
mod memory;
mod registry;
mod store;

pub use batch::{BatchError, BatchOp, ReadView, Repository, WriteBatch};
pub use cas::{ContentAddressedStore, GcStats, VerifyReport};
pub use config::{BackendKind, LsmConfig, RegistryConfig, DEFAULT_SYNC_INTERVAL};
pub use context::Context;
pub use encrypted::{
    detect_header, header, Algorithm, EncryptedStore, EncryptionKey, BOUNDARY, HEADER_SIZE,
    KEY_SIZE, MAGIC, NONCE_SIZE, TAG_SIZE,
};
pub use error::{StorageError, StorageResult};
pub use flat::{FlatFileStore, FLAT_FILE_MAX_KEY_LEN, FLAT_FILE_SOFT_LIMIT};
pub use lsm::{LsmStore, SyncTicker};
pub use memory::MemoryStore;
pub use registry::{validate_store_name, NameIter, StoreProvider, StoreRegistry, MAX_STORE_NAME_LEN};
pub use store::{validate_key, BlobReader, BlobWriter, KeyIter, ListOptions, Store};
