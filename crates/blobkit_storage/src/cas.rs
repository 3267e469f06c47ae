//! Content-addressed, deduplicating file store.
//!
//! ## Layout
//!
//! ```text
//! <dir>/
//! ├─ index.redb                     # key -> digest, digest -> refcount
//! ├─ blobs/3a/7f/3a7f...e1          # one file per distinct SHA-512 digest
//! └─ tmp/                           # in-flight writes
//! ```
//!
//! ## Write protocol
//!
//! 1. Stream the value to a temp file while hashing it with SHA-512.
//! 2. Sync the temp file and finalize the digest.
//! 3. Create the fan-out directory for the digest.
//! 4. Rename the temp file onto the digest path. Identical content renames
//!    onto byte-identical content, so deduplication needs no extra branch.
//! 5. In one index transaction, point the key at the digest and adjust the
//!    reference counts of the new and previous digests.
//!
//! A crash between steps 4 and 5 leaves an orphan blob, never a key pointing
//! at missing content. Orphans and digests whose count dropped to zero stay
//! on disk until [`ContentAddressedStore::collect_garbage`] is called.

use crate::context::Context;
use crate::error::{StorageError, StorageResult};
use crate::store::{validate_key, BlobReader, BlobWriter, KeyIter, ListOptions, PagedKeys, Store};
use parking_lot::RwLock;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use sha2::{Digest, Sha512};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Logical key -> hex SHA-512 digest.
const KEYS: TableDefinition<&str, &str> = TableDefinition::new("keys");

/// Hex SHA-512 digest -> number of keys referencing it.
const REFS: TableDefinition<&str, u64> = TableDefinition::new("refs");

const INDEX_FILE: &str = "index.redb";
const BLOBS_DIR: &str = "blobs";
const TMP_DIR: &str = "tmp";

/// Outcome of [`ContentAddressedStore::collect_garbage`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Digests whose count had reached zero.
    pub unreferenced_removed: usize,
    /// Blob files with no index entry at all.
    pub orphans_removed: usize,
    /// Bytes freed on disk.
    pub bytes_freed: u64,
}

/// Outcome of [`ContentAddressedStore::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Referenced digests that were rehashed.
    pub checked: usize,
    /// Referenced digests with no blob file.
    pub missing: Vec<String>,
    /// Referenced digests whose file no longer hashes to the digest.
    pub corrupt: Vec<String>,
}

impl VerifyReport {
    /// Returns true if every referenced blob is present and intact.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.corrupt.is_empty()
    }
}

/// A deduplicating store addressing values by their SHA-512 digest.
///
/// Keys are listed in ascending order.
///
/// # Thread Safety
///
/// The index transaction is the only point of mutual exclusion between
/// writers; publishing a blob is an atomic rename keyed by content, so
/// concurrent writers of the same content are harmless. A per-instance
/// maintenance lock keeps garbage collection from observing a blob between
/// its rename and its index update.
pub struct ContentAddressedStore {
    name: String,
    dir: PathBuf,
    db: Database,
    maintenance: RwLock<()>,
}

impl std::fmt::Debug for ContentAddressedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentAddressedStore")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl ContentAddressedStore {
    /// Opens or creates a content-addressed store in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories or the index cannot be created.
    pub fn open(dir: &Path, name: impl Into<String>) -> StorageResult<Self> {
        fs::create_dir_all(dir.join(BLOBS_DIR))?;
        let tmp = dir.join(TMP_DIR);
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)?;

        let db = Database::create(dir.join(INDEX_FILE))?;

        // Pre-create tables so read transactions never see them missing
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(KEYS)?;
            let _ = txn.open_table(REFS)?;
        }
        txn.commit()?;

        Ok(Self {
            name: name.into(),
            dir: dir.to_path_buf(),
            db,
            maintenance: RwLock::new(()),
        })
    }

    /// Returns the store's root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Returns the path a blob with `digest` is stored under.
    #[must_use]
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let mut path = self.dir.join(BLOBS_DIR);
        if digest.len() >= 4 {
            path.push(&digest[0..2]);
            path.push(&digest[2..4]);
        }
        path.push(digest);
        path
    }

    /// Returns the digest `key` currently points at.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    pub fn digest_of(&self, key: &str) -> StorageResult<Option<String>> {
        let txn = self.db.begin_read()?;
        let keys = txn.open_table(KEYS)?;
        let digest = keys.get(key)?.map(|guard| guard.value().to_string());
        Ok(digest)
    }

    /// Returns how many keys reference `digest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    pub fn ref_count(&self, digest: &str) -> StorageResult<u64> {
        let txn = self.db.begin_read()?;
        let refs = txn.open_table(REFS)?;
        let count = refs.get(digest)?.map_or(0, |guard| guard.value());
        Ok(count)
    }

    /// Returns the number of physical blob files.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob directory cannot be scanned.
    pub fn blob_count(&self) -> StorageResult<usize> {
        Ok(self.blob_files()?.len())
    }

    /// Removes unreferenced and orphaned blobs.
    ///
    /// This is an explicit maintenance operation; no write path ever calls
    /// it. Writers are held off for its duration.
    ///
    /// # Errors
    ///
    /// Returns an error if the index or the blob directory cannot be updated.
    pub fn collect_garbage(&self, ctx: &Context) -> StorageResult<GcStats> {
        ctx.check()?;
        let _exclusive = self.maintenance.write();
        let mut stats = GcStats::default();

        let txn = self.db.begin_write()?;
        let mut referenced = HashSet::new();
        let mut unreferenced = Vec::new();
        {
            let mut refs = txn.open_table(REFS)?;
            for entry in refs.iter()? {
                let (digest, count) = entry?;
                if count.value() == 0 {
                    unreferenced.push(digest.value().to_string());
                } else {
                    referenced.insert(digest.value().to_string());
                }
            }
            for digest in &unreferenced {
                refs.remove(digest.as_str())?;
            }
        }
        txn.commit()?;

        for (digest, path) in self.blob_files()? {
            ctx.check()?;
            if referenced.contains(&digest) {
                continue;
            }
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
            stats.bytes_freed += size;
            if unreferenced.contains(&digest) {
                stats.unreferenced_removed += 1;
            } else {
                warn!(store = %self.name, %digest, "removed orphan blob");
                stats.orphans_removed += 1;
            }
        }

        info!(
            store = %self.name,
            unreferenced = stats.unreferenced_removed,
            orphans = stats.orphans_removed,
            bytes = stats.bytes_freed,
            "garbage collection finished"
        );
        Ok(stats)
    }

    /// Rehashes every referenced blob and reports missing or corrupt files.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read or a blob cannot be
    /// opened for a reason other than absence.
    pub fn verify(&self, ctx: &Context) -> StorageResult<VerifyReport> {
        let digests: Vec<String> = {
            let txn = self.db.begin_read()?;
            let refs = txn.open_table(REFS)?;
            let mut digests = Vec::new();
            for entry in refs.iter()? {
                let (digest, count) = entry?;
                if count.value() > 0 {
                    digests.push(digest.value().to_string());
                }
            }
            digests
        };

        let mut report = VerifyReport::default();
        for digest in digests {
            ctx.check()?;
            report.checked += 1;
            let mut file = match File::open(self.blob_path(&digest)) {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    report.missing.push(digest);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            let mut hasher = Sha512::new();
            io::copy(&mut file, &mut hasher)?;
            if hex::encode(hasher.finalize()) != digest {
                report.corrupt.push(digest);
            }
        }
        Ok(report)
    }

    fn blob_files(&self) -> StorageResult<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();
        for level1 in fs::read_dir(self.dir.join(BLOBS_DIR))? {
            let level1 = level1?;
            if !level1.file_type()?.is_dir() {
                continue;
            }
            for level2 in fs::read_dir(level1.path())? {
                let level2 = level2?;
                if !level2.file_type()?.is_dir() {
                    continue;
                }
                for blob in fs::read_dir(level2.path())? {
                    let blob = blob?;
                    if let Some(name) = blob.file_name().to_str() {
                        files.push((name.to_string(), blob.path()));
                    }
                }
            }
        }
        Ok(files)
    }

    /// Points `key` at `digest` and adjusts reference counts, atomically.
    fn link(&self, key: &str, digest: &str) -> StorageResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut keys = txn.open_table(KEYS)?;
            let mut refs = txn.open_table(REFS)?;
            let previous = keys.insert(key, digest)?.map(|old| old.value().to_string());
            if previous.as_deref() != Some(digest) {
                let count = refs.get(digest)?.map_or(0, |guard| guard.value());
                refs.insert(digest, adjusted(count, 1))?;
                if let Some(old) = previous {
                    let count = refs.get(old.as_str())?.map_or(0, |guard| guard.value());
                    refs.insert(old.as_str(), adjusted(count, -1))?;
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn fetch_page(
        &self,
        opts: &ListOptions,
        after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<String>> {
        let txn = self.db.begin_read()?;
        let keys = txn.open_table(KEYS)?;
        let start = opts.start_bound(after);
        let range: (Bound<&str>, Bound<&str>) =
            (start.as_ref().map(String::as_str), Bound::Unbounded);

        let mut page = Vec::with_capacity(limit);
        for entry in keys.range::<&str>(range)? {
            let (key, _) = entry?;
            let key = key.value();
            if opts.is_past_end(key) {
                break;
            }
            if opts.matches(key) {
                page.push(key.to_string());
                if page.len() == limit {
                    break;
                }
            }
        }
        Ok(page)
    }
}

/// Applies a reference count change, saturating at zero.
fn adjusted(current: u64, delta: i64) -> u64 {
    if delta >= 0 {
        current.saturating_add(delta.unsigned_abs())
    } else {
        current.saturating_sub(delta.unsigned_abs())
    }
}

impl Store for ContentAddressedStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn list<'a>(&'a self, ctx: &Context, opts: &ListOptions) -> StorageResult<KeyIter<'a>> {
        ctx.check()?;
        let opts = opts.clone();
        Ok(Box::new(PagedKeys::new(ctx, move |after: Option<&str>, limit| {
            self.fetch_page(&opts, after, limit)
        })))
    }

    fn exists(&self, ctx: &Context, key: &str) -> StorageResult<bool> {
        ctx.check()?;
        Ok(self.digest_of(key)?.is_some())
    }

    fn delete(&self, ctx: &Context, key: &str) -> StorageResult<()> {
        ctx.check()?;
        let txn = self.db.begin_write()?;
        {
            let mut keys = txn.open_table(KEYS)?;
            let mut refs = txn.open_table(REFS)?;
            let removed = keys.remove(key)?.map(|old| old.value().to_string());
            if let Some(digest) = removed {
                let count = refs.get(digest.as_str())?.map_or(0, |guard| guard.value());
                refs.insert(digest.as_str(), adjusted(count, -1))?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn reader(&self, ctx: &Context, key: &str) -> StorageResult<Option<BlobReader>> {
        ctx.check()?;
        let _shared = self.maintenance.read();
        let Some(digest) = self.digest_of(key)? else {
            return Ok(None);
        };
        match File::open(self.blob_path(&digest)) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StorageError::corrupted(
                format!("key {key:?} references missing blob {digest}"),
            )),
            Err(err) => Err(err.into()),
        }
    }

    fn writer<'a>(&'a self, ctx: &Context, key: &str) -> StorageResult<Box<dyn BlobWriter + 'a>> {
        validate_key(key)?;
        ctx.check()?;
        let temp = NamedTempFile::new_in(self.dir.join(TMP_DIR))?;
        Ok(Box::new(CasWriter {
            store: self,
            ctx: ctx.clone(),
            key: key.to_string(),
            temp,
            hasher: Sha512::new(),
        }))
    }
}

struct CasWriter<'a> {
    store: &'a ContentAddressedStore,
    ctx: Context,
    key: String,
    temp: NamedTempFile,
    hasher: Sha512,
}

impl Write for CasWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.temp.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.temp.flush()
    }
}

impl BlobWriter for CasWriter<'_> {
    fn commit(self: Box<Self>) -> StorageResult<()> {
        let CasWriter {
            store,
            ctx,
            key,
            mut temp,
            hasher,
        } = *self;
        ctx.check()?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        let digest = hex::encode(hasher.finalize());

        let _shared = store.maintenance.read();
        let path = store.blob_path(&digest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Last point at which the write can be abandoned without an orphan.
        ctx.check()?;
        temp.persist(&path).map_err(|err| err.error)?;
        store.link(&key, &digest)?;
        debug!(store = %store.name, %key, %digest, "committed value");
        Ok(())
    }
}
