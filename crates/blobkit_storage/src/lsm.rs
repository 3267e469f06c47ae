//! LSM-tree backed store with relaxed durability.
//!
//! Writes go to the engine's journal without a per-write fsync. A
//! background [`SyncTicker`] persists everything every
//! [`LsmConfig::sync_interval`](crate::LsmConfig) (10 minutes by default).
//!
//! ## Durability tradeoff
//!
//! A hard crash may lose writes made since the last sync. It never corrupts
//! data that was already synced: the engine's own crash recovery is
//! untouched, only the recency of durable data is traded for throughput.
//! Call [`Store::sync`] when a particular write must be durable.

use crate::config::LsmConfig;
use crate::context::Context;
use crate::error::{StorageError, StorageResult};
use crate::store::{validate_key, BlobReader, BlobWriter, KeyIter, ListOptions, PagedKeys, Store};
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode, Slice};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const PARTITION: &str = "values";

/// A store backed by an embedded LSM-tree.
///
/// Keys are listed in ascending order.
pub struct LsmStore {
    name: String,
    path: PathBuf,
    keyspace: Keyspace,
    values: PartitionHandle,
    ticker: Mutex<Option<SyncTicker>>,
}

impl std::fmt::Debug for LsmStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmStore")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl LsmStore {
    /// Opens or creates an LSM store in `dir`.
    ///
    /// Starts the background sync ticker unless disabled in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot open the directory.
    pub fn open(dir: &Path, name: impl Into<String>, config: &LsmConfig) -> StorageResult<Self> {
        let name = name.into();
        let keyspace = fjall::Config::new(dir)
            .manual_journal_persist(true)
            .open()?;
        let values = keyspace.open_partition(PARTITION, PartitionCreateOptions::default())?;

        let ticker = if config.background_sync {
            Some(SyncTicker::start(
                keyspace.clone(),
                name.clone(),
                config.sync_interval,
            )?)
        } else {
            None
        };

        info!(store = %name, path = ?dir, "opened lsm store");
        Ok(Self {
            name,
            path: dir.to_path_buf(),
            keyspace,
            values,
            ticker: Mutex::new(ticker),
        })
    }

    /// Returns the engine directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true while the background sync ticker is running.
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.ticker.lock().is_some()
    }

    /// Stops the background sync ticker, then performs a final sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails.
    pub fn stop_sync(&self) -> StorageResult<()> {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.stop();
        }
        self.sync()
    }

    fn fetch_page(
        &self,
        opts: &ListOptions,
        after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<String>> {
        let start: Bound<Vec<u8>> = opts.start_bound(after).map(String::into_bytes);
        let mut page = Vec::with_capacity(limit);
        for item in self.values.range((start, Bound::<Vec<u8>>::Unbounded)) {
            let (key, _) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|_| StorageError::corrupted("lsm store holds a non-UTF-8 key"))?;
            if opts.is_past_end(&key) {
                break;
            }
            if opts.matches(&key) {
                page.push(key);
                if page.len() == limit {
                    break;
                }
            }
        }
        Ok(page)
    }
}

impl Drop for LsmStore {
    fn drop(&mut self) {
        if let Err(err) = self.stop_sync() {
            warn!(store = %self.name, error = %err, "final sync on close failed");
        }
    }
}

impl Store for LsmStore {
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
        Ok(self.values.contains_key(key)?)
    }

    fn delete(&self, ctx: &Context, key: &str) -> StorageResult<()> {
        ctx.check()?;
        self.values.remove(key)?;
        Ok(())
    }

    /// The returned reader holds the engine's reference-counted value
    /// buffer until dropped instead of copying the value.
    fn reader(&self, ctx: &Context, key: &str) -> StorageResult<Option<BlobReader>> {
        ctx.check()?;
        Ok(self
            .values
            .get(key)?
            .map(|value| Box::new(SliceReader { value, pos: 0 }) as BlobReader))
    }

    fn writer<'a>(&'a self, ctx: &Context, key: &str) -> StorageResult<Box<dyn BlobWriter + 'a>> {
        validate_key(key)?;
        ctx.check()?;
        Ok(Box::new(LsmWriter {
            store: self,
            ctx: ctx.clone(),
            key: key.to_string(),
            buffer: Vec::new(),
        }))
    }

    fn sync(&self) -> StorageResult<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        debug!(store = %self.name, "synced lsm store");
        Ok(())
    }
}

struct SliceReader {
    value: Slice,
    pos: usize,
}

impl Read for SliceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.value[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

struct LsmWriter<'a> {
    store: &'a LsmStore,
    ctx: Context,
    key: String,
    buffer: Vec<u8>,
}

impl Write for LsmWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobWriter for LsmWriter<'_> {
    fn commit(self: Box<Self>) -> StorageResult<()> {
        self.ctx.check()?;
        let this = *self;
        this.store.values.insert(this.key.as_str(), this.buffer)?;
        Ok(())
    }
}

/// Background thread persisting a keyspace on a fixed interval.
///
/// Runs until [`SyncTicker::stop`] is called or the ticker is dropped.
pub struct SyncTicker {
    stop_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl SyncTicker {
    fn start(keyspace: Keyspace, store: String, interval: Duration) -> StorageResult<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name(format!("blobkit-sync-{store}"))
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        match keyspace.persist(PersistMode::SyncAll) {
                            Ok(()) => debug!(%store, "periodic sync"),
                            Err(err) => warn!(%store, error = %err, "periodic sync failed"),
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Stops the ticker and waits for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("sync ticker thread panicked");
            }
        }
    }
}

impl Drop for SyncTicker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn config() -> LsmConfig {
        LsmConfig::new().background_sync(false)
    }

    fn copy_dir(from: &Path, to: &Path) {
        fs::create_dir_all(to).unwrap();
        for entry in fs::read_dir(from).unwrap() {
            let entry = entry.unwrap();
            let target = to.join(entry.file_name());
            if entry.file_type().unwrap().is_dir() {
                copy_dir(&entry.path(), &target);
            } else {
                // Files may vanish while the engine runs; a crash image
                // simply would not contain them.
                let _ = fs::copy(entry.path(), &target);
            }
        }
    }

    #[test]
    fn lsm_put_and_get() {
        let dir = tempdir().unwrap();
        let store = LsmStore::open(dir.path(), "lsm", &config()).unwrap();
        let ctx = Context::background();
        store.put(&ctx, "x", b"{\"a\":\"1\"}").unwrap();
        assert_eq!(store.get(&ctx, "x").unwrap().unwrap(), b"{\"a\":\"1\"}");
        assert!(store.exists(&ctx, "x").unwrap());
    }

    #[test]
    fn lsm_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = LsmStore::open(dir.path(), "lsm", &config()).unwrap();
        let ctx = Context::background();
        store.delete(&ctx, "absent").unwrap();
        store.put(&ctx, "k", b"v").unwrap();
        store.delete(&ctx, "k").unwrap();
        store.delete(&ctx, "k").unwrap();
        assert!(store.reader(&ctx, "k").unwrap().is_none());
    }

    #[test]
    fn lsm_cancelled_commit_is_discarded() {
        let dir = tempdir().unwrap();
        let store = LsmStore::open(dir.path(), "lsm", &config()).unwrap();
        let ctx = Context::background();
        let mut writer = store.writer(&ctx, "k").unwrap();
        writer.write_all(b"value").unwrap();
        ctx.cancel();
        assert!(writer.commit().is_err());
        assert!(!store.exists(&Context::background(), "k").unwrap());
    }

    #[test]
    fn lsm_list_is_ordered_with_prefix() {
        let dir = tempdir().unwrap();
        let store = LsmStore::open(dir.path(), "lsm", &config()).unwrap();
        let ctx = Context::background();
        for key in ["doc/3", "doc/1", "img/1", "doc/2"] {
            store.put(&ctx, key, b"v").unwrap();
        }
        let keys: Vec<String> = store
            .list(&ctx, &ListOptions::new().prefix("doc/"))
            .unwrap()
            .map(|k| k.unwrap())
            .collect();
        assert_eq!(keys, ["doc/1", "doc/2", "doc/3"]);
    }

    #[test]
    fn lsm_reopen_after_sync() {
        let dir = tempdir().unwrap();
        let ctx = Context::background();
        {
            let store = LsmStore::open(dir.path(), "lsm", &config()).unwrap();
            store.put(&ctx, "k", b"durable").unwrap();
            store.sync().unwrap();
        }
        let store = LsmStore::open(dir.path(), "lsm", &config()).unwrap();
        assert_eq!(store.get(&ctx, "k").unwrap().unwrap(), b"durable");
    }

    #[test]
    fn lsm_crash_image_keeps_synced_keys_intact() {
        let dir = tempdir().unwrap();
        let crash = tempdir().unwrap();
        let ctx = Context::background();

        let store = LsmStore::open(dir.path(), "lsm", &config()).unwrap();
        for i in 0..50 {
            store
                .put(&ctx, &format!("synced/{i:03}"), format!("value-{i}").as_bytes())
                .unwrap();
        }
        store.sync().unwrap();
        store.put(&ctx, "unsynced", b"maybe lost").unwrap();

        // Snapshot the on-disk state as a hard crash would leave it
        copy_dir(dir.path(), crash.path());

        let recovered = LsmStore::open(crash.path(), "lsm", &config()).unwrap();
        for i in 0..50 {
            assert_eq!(
                recovered.get(&ctx, &format!("synced/{i:03}")).unwrap().unwrap(),
                format!("value-{i}").as_bytes()
            );
        }
        // The unsynced write is either gone or whole, never partial
        if let Some(value) = recovered.get(&ctx, "unsynced").unwrap() {
            assert_eq!(value, b"maybe lost");
        }
        drop(store);
    }

    #[test]
    fn lsm_ticker_starts_and_stops() {
        let dir = tempdir().unwrap();
        let config = LsmConfig::new().sync_interval(Duration::from_millis(10));
        let store = LsmStore::open(dir.path(), "lsm", &config).unwrap();
        assert!(store.is_syncing());

        store.put(&Context::background(), "k", b"v").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        store.stop_sync().unwrap();
        assert!(!store.is_syncing());
    }
}
