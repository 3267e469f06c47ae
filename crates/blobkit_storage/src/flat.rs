//! Flat-file store: one file per key in a single directory.
//!
//! ## Layout
//!
//! ```text
//! <dir>/
//! ├─ 6b6579                 # hex("key"), one file per value
//! ├─ 6f74686572             # hex("other")
//! └─ .tmp-XXXXXX            # in-flight writes, never listed
//! ```
//!
//! ## Commit protocol
//!
//! A writer streams into a randomly-named temporary file in the same
//! directory, syncs it, then renames it over the target name. The rename is
//! the sole commit point: a crash before it leaves the previous value (or
//! absence) intact, and leftover temporaries are removed on the next open.
//!
//! ## Scaling ceiling
//!
//! Every value lives in one directory. Most filesystems degrade past roughly
//! [`FLAT_FILE_SOFT_LIMIT`] entries per directory; listing a store larger
//! than that logs a warning. Use [`crate::ContentAddressedStore`] for large
//! stores.

use crate::context::Context;
use crate::error::{StorageError, StorageResult};
use crate::store::{validate_key, BlobReader, BlobWriter, KeyIter, ListOptions, Store};
use std::fs::{self, File, ReadDir};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Entry count past which a single directory is expected to degrade.
pub const FLAT_FILE_SOFT_LIMIT: usize = 10_000;

/// Longest key accepted, in bytes. Hex encoding doubles the length and most
/// filesystems cap a file name at 255 bytes.
pub const FLAT_FILE_MAX_KEY_LEN: usize = 127;

const TEMP_PREFIX: &str = ".tmp-";

/// A store keeping each value in its own file.
///
/// Listing order is unspecified.
#[derive(Debug)]
pub struct FlatFileStore {
    name: String,
    dir: PathBuf,
    warned_ceiling: AtomicBool,
}

impl FlatFileStore {
    /// Opens or creates a flat-file store in `dir`.
    ///
    /// Temporary files left behind by an interrupted writer are removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or scanned.
    pub fn open(dir: &Path, name: impl Into<String>) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        let store = Self {
            name: name.into(),
            dir: dir.to_path_buf(),
            warned_ceiling: AtomicBool::new(false),
        };
        store.remove_stale_temp_files()?;
        Ok(store)
    }

    /// Returns the directory holding the values.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        check_flat_key(key)?;
        Ok(self.dir.join(hex::encode(key.as_bytes())))
    }

    /// Path of a key that may exist. Over-long keys can never have been
    /// written, so they map to `None` instead of an error.
    fn lookup_path(&self, key: &str) -> StorageResult<Option<PathBuf>> {
        validate_key(key)?;
        if key.len() > FLAT_FILE_MAX_KEY_LEN {
            return Ok(None);
        }
        Ok(Some(self.dir.join(hex::encode(key.as_bytes()))))
    }

    fn remove_stale_temp_files(&self) -> StorageResult<()> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                debug!(store = %self.name, path = ?entry.path(), "removing stale temp file");
                if let Err(err) = fs::remove_file(entry.path()) {
                    if err.kind() != io::ErrorKind::NotFound {
                        return Err(err.into());
                    }
                }
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> StorageResult<()> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Rejects keys a flat-file store can't hold.
///
/// # Errors
///
/// Returns [`StorageError::InvalidKey`] for an empty key or one longer than
/// [`FLAT_FILE_MAX_KEY_LEN`] bytes.
pub(crate) fn check_flat_key(key: &str) -> StorageResult<()> {
    validate_key(key)?;
    if key.len() > FLAT_FILE_MAX_KEY_LEN {
        return Err(StorageError::invalid_key(
            key,
            format!("flat-file keys are limited to {FLAT_FILE_MAX_KEY_LEN} bytes"),
        ));
    }
    Ok(())
}

/// Decodes a file name back into its key, or `None` for foreign files.
fn decode_file_name(name: &str) -> Option<String> {
    let bytes = hex::decode(name).ok()?;
    String::from_utf8(bytes).ok().filter(|key| !key.is_empty())
}

impl Store for FlatFileStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn list<'a>(&'a self, ctx: &Context, opts: &ListOptions) -> StorageResult<KeyIter<'a>> {
        ctx.check()?;
        Ok(Box::new(FlatKeys {
            store: self,
            entries: fs::read_dir(&self.dir)?,
            ctx: ctx.clone(),
            opts: opts.clone(),
            seen: 0,
            done: false,
        }))
    }

    fn exists(&self, ctx: &Context, key: &str) -> StorageResult<bool> {
        ctx.check()?;
        match self.lookup_path(key)? {
            Some(path) => Ok(path.try_exists()?),
            None => Ok(false),
        }
    }

    fn delete(&self, ctx: &Context, key: &str) -> StorageResult<()> {
        ctx.check()?;
        let Some(path) = self.lookup_path(key)? else {
            return Ok(());
        };
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn reader(&self, ctx: &Context, key: &str) -> StorageResult<Option<BlobReader>> {
        ctx.check()?;
        let Some(path) = self.lookup_path(key)? else {
            return Ok(None);
        };
        match File::open(path) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn check_key(&self, key: &str) -> StorageResult<()> {
        check_flat_key(key)
    }

    fn writer<'a>(&'a self, ctx: &Context, key: &str) -> StorageResult<Box<dyn BlobWriter + 'a>> {
        ctx.check()?;
        let target = self.key_path(key)?;
        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.dir)?;
        Ok(Box::new(FlatWriter {
            store: self,
            ctx: ctx.clone(),
            target,
            temp,
        }))
    }
}

struct FlatKeys<'a> {
    store: &'a FlatFileStore,
    entries: ReadDir,
    ctx: Context,
    opts: ListOptions,
    seen: usize,
    done: bool,
}

impl Iterator for FlatKeys<'_> {
    type Item = StorageResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if let Err(err) = self.ctx.check() {
                self.done = true;
                return Some(Err(err));
            }
            let entry = match self.entries.next() {
                Some(Ok(entry)) => entry,
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
                None => {
                    self.done = true;
                    return None;
                }
            };
            let file_name = entry.file_name();
            let Some(key) = file_name.to_str().and_then(decode_file_name) else {
                continue;
            };
            self.seen += 1;
            if self.seen == FLAT_FILE_SOFT_LIMIT + 1
                && !self.store.warned_ceiling.swap(true, Ordering::Relaxed)
            {
                warn!(
                    store = %self.store.name,
                    limit = FLAT_FILE_SOFT_LIMIT,
                    "flat-file store exceeds its single-directory scaling ceiling"
                );
            }
            if self.opts.matches(&key) {
                return Some(Ok(key));
            }
        }
        None
    }
}

struct FlatWriter<'a> {
    store: &'a FlatFileStore,
    ctx: Context,
    target: PathBuf,
    temp: NamedTempFile,
}

impl Write for FlatWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.temp.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.temp.flush()
    }
}

impl BlobWriter for FlatWriter<'_> {
    fn commit(self: Box<Self>) -> StorageResult<()> {
        let FlatWriter {
            store,
            ctx,
            target,
            mut temp,
        } = *self;
        // Dropping `temp` on any early return deletes it.
        ctx.check()?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        ctx.check()?;
        temp.persist(&target).map_err(|err| err.error)?;
        store.sync_directory()?;
        debug!(store = %store.name, path = ?target, "committed value");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path) -> FlatFileStore {
        FlatFileStore::open(dir, "flat").unwrap()
    }

    #[test]
    fn flat_put_and_get() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let ctx = Context::background();

        store.put(&ctx, "doc/1", b"{\"a\":\"1\"}").unwrap();
        assert_eq!(store.get(&ctx, "doc/1").unwrap().unwrap(), b"{\"a\":\"1\"}");
        assert!(dir.path().join(hex::encode("doc/1")).exists());
    }

    #[test]
    fn flat_persistence() {
        let dir = tempdir().unwrap();
        let ctx = Context::background();
        {
            let store = open(dir.path());
            store.put(&ctx, "k", b"persistent data").unwrap();
        }
        let store = open(dir.path());
        assert_eq!(store.get(&ctx, "k").unwrap().unwrap(), b"persistent data");
    }

    #[test]
    fn flat_overwrite_replaces_value() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let ctx = Context::background();
        store.put(&ctx, "k", b"first").unwrap();
        store.put(&ctx, "k", b"second").unwrap();
        assert_eq!(store.get(&ctx, "k").unwrap().unwrap(), b"second");
    }

    #[test]
    fn flat_delete_absent_is_ok() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let ctx = Context::background();
        store.delete(&ctx, "missing").unwrap();
        store.put(&ctx, "k", b"v").unwrap();
        store.delete(&ctx, "k").unwrap();
        store.delete(&ctx, "k").unwrap();
        assert!(store.reader(&ctx, "k").unwrap().is_none());
    }

    #[test]
    fn flat_abandoned_writer_leaves_previous_value() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let ctx = Context::background();
        store.put(&ctx, "k", b"old").unwrap();

        {
            let mut writer = store.writer(&ctx, "k").unwrap();
            writer.write_all(b"half-written").unwrap();
        }

        assert_eq!(store.get(&ctx, "k").unwrap().unwrap(), b"old");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn flat_cancelled_commit_publishes_nothing() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let ctx = Context::background();

        let mut writer = store.writer(&ctx, "k").unwrap();
        writer.write_all(b"value").unwrap();
        ctx.cancel();
        assert!(writer.commit().is_err());

        assert!(!store.exists(&Context::background(), "k").unwrap());
    }

    #[test]
    fn flat_stale_temp_files_removed_on_open() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".tmp-crashed"), b"junk").unwrap();
        let store = open(dir.path());
        assert!(!dir.path().join(".tmp-crashed").exists());
        assert_eq!(store.list(&Context::background(), &ListOptions::new()).unwrap().count(), 0);
    }

    #[test]
    fn flat_list_filters_and_skips_foreign_files() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let ctx = Context::background();
        for key in ["a/1", "a/2", "b/1"] {
            store.put(&ctx, key, b"x").unwrap();
        }
        fs::write(dir.path().join("README"), b"not a key").unwrap();

        let mut all: Vec<String> = store
            .list(&ctx, &ListOptions::new())
            .unwrap()
            .map(|k| k.unwrap())
            .collect();
        all.sort();
        assert_eq!(all, ["a/1", "a/2", "b/1"]);

        let mut prefixed: Vec<String> = store
            .list(&ctx, &ListOptions::new().prefix("a/"))
            .unwrap()
            .map(|k| k.unwrap())
            .collect();
        prefixed.sort();
        assert_eq!(prefixed, ["a/1", "a/2"]);
    }

    #[test]
    fn flat_rejects_oversized_keys() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let key = "k".repeat(FLAT_FILE_MAX_KEY_LEN + 1);
        assert!(matches!(
            store.writer(&Context::background(), &key),
            Err(StorageError::InvalidKey { .. })
        ));
        assert!(matches!(store.check_key(&key), Err(StorageError::InvalidKey { .. })));
        store.check_key(&"k".repeat(FLAT_FILE_MAX_KEY_LEN)).unwrap();
    }

    #[test]
    fn flat_oversized_keys_read_as_absent() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let ctx = Context::background();
        let key = "k".repeat(200);

        assert!(store.reader(&ctx, &key).unwrap().is_none());
        assert!(!store.exists(&ctx, &key).unwrap());
        store.delete(&ctx, &key).unwrap();
        assert!(matches!(store.exists(&ctx, ""), Err(StorageError::InvalidKey { .. })));
    }
}
