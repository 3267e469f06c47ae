//! Export of every store into one archive.
//!
//! ## Archive layout
//!
//! ```text
//! data/0 … data/N-1   # one member per value, numbered in export order
//! index.json          # manifest, written last
//! ```
//!
//! The archive is assembled in a temporary file and copied to the sink
//! once complete. File stores are exported first, then entity stores. No lock spans the
//! run, so a backup of a live system is a fuzzy snapshot: a value written
//! during the run may or may not be included, and a key deleted between
//! listing and reading is skipped.

use crate::config::Compression;
use crate::engine::{BackupEngine, BackupSummary};
use crate::error::BackupResult;
use crate::hashing::HashingWriter;
use crate::manifest::{data_path, BackupIndex, BlobRecord, Stereotype, StoreRecord, INDEX_NAME};
use crate::subject::{authorize, Permission, Subject};
use blobkit_storage::{validate_store_name, Context, ListOptions, Store};
use chrono::Utc;
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, Write};
use std::time::Instant;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

fn member_options(compression: Compression) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(compression.method())
        .large_file(true)
}

impl BackupEngine {
    /// Writes every store to `sink` as a zip archive.
    ///
    /// The subject must hold [`Permission::Backup`]; otherwise nothing is
    /// written. The archive is assembled in a temporary file first, so
    /// `sink` may be any byte sink (a socket, a pipe, a response body). It
    /// receives bytes only once every store has been exported.
    ///
    /// # Errors
    ///
    /// - [`crate::BackupError::Unauthorized`] before any I/O
    /// - store, staging, archive and sink errors as they occur
    pub fn backup<W: Write>(
        &self,
        ctx: &Context,
        subject: &dyn Subject,
        mut sink: W,
    ) -> BackupResult<BackupSummary> {
        authorize(subject, Permission::Backup)?;
        ctx.check()?;

        let started = Instant::now();
        info!(subject = %subject.describe(), "backup started");

        let (staged, summary) = self.assemble(ctx)?;
        let written = self.deliver(ctx, staged, &mut sink)?;

        info!(
            stores = summary.stores,
            blobs = summary.blobs,
            bytes = summary.bytes,
            skipped = summary.skipped,
            archive_bytes = written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "backup finished"
        );
        Ok(summary)
    }

    /// Exports every store into a finished archive in a temporary file.
    fn assemble(&self, ctx: &Context) -> BackupResult<(File, BackupSummary)> {
        let file = match &self.backup_config.staging_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        let mut index = BackupIndex::new(Utc::now());
        let mut exporter = Exporter {
            ctx,
            archive: ZipWriter::new(BufWriter::new(file)),
            compression: self.backup_config.blob_compression,
            next_member: 0,
            skipped: 0,
        };

        for stereotype in [Stereotype::Blob, Stereotype::Document] {
            for name in self.store_names(stereotype) {
                let name = name?;
                ctx.check()?;
                validate_store_name(&name)?;
                let store = self.open_store(stereotype, &name)?;
                let record = exporter.export_store(&name, stereotype, store.as_ref())?;
                info!(
                    store = %name,
                    %stereotype,
                    blobs = record.blobs.len(),
                    bytes = record.total_bytes(),
                    "store exported"
                );
                index.stores.push(record);
            }
        }

        ctx.check()?;
        let manifest = index.to_json()?;
        exporter
            .archive
            .start_file(INDEX_NAME, member_options(self.backup_config.manifest_compression))?;
        exporter.archive.write_all(&manifest)?;
        let mut file = exporter
            .archive
            .finish()?
            .into_inner()
            .map_err(|e| e.into_error())?;
        file.rewind()?;

        let summary = BackupSummary {
            created_at: index.created_at,
            stores: index.stores.len(),
            blobs: index.blob_count(),
            bytes: index.total_bytes(),
            skipped: exporter.skipped,
        };
        Ok((file, summary))
    }

    /// Copies the staged archive to the caller's sink.
    fn deliver<W: Write>(&self, ctx: &Context, mut staged: File, sink: &mut W) -> BackupResult<u64> {
        let mut buf = vec![0u8; self.backup_config.buffer_size.max(1)];
        let mut written = 0u64;
        loop {
            ctx.check()?;
            let n = match staged.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            sink.write_all(&buf[..n])?;
            written += n as u64;
        }
        sink.flush()?;
        debug!(bytes = written, "archive delivered");
        Ok(written)
    }
}

struct Exporter<'c, W: Write + Seek> {
    ctx: &'c Context,
    archive: ZipWriter<W>,
    compression: Compression,
    next_member: u64,
    skipped: usize,
}

impl<W: Write + Seek> Exporter<'_, W> {
    fn export_store(
        &mut self,
        name: &str,
        stereotype: Stereotype,
        store: &dyn Store,
    ) -> BackupResult<StoreRecord> {
        let mut record = StoreRecord::new(name, stereotype);

        for key in store.list(self.ctx, &ListOptions::new())? {
            let key = key?;
            self.ctx.check()?;

            let Some(mut reader) = store.reader(self.ctx, &key)? else {
                warn!(store = %name, %key, "key vanished during backup, skipping");
                self.skipped += 1;
                continue;
            };

            let path = data_path(self.next_member);
            self.next_member += 1;
            self.archive
                .start_file(path.as_str(), member_options(self.compression))?;

            let mut hashing = HashingWriter::new(&mut self.archive);
            io::copy(&mut reader, &mut hashing)?;
            let (_, size, sha256) = hashing.finish();

            debug!(store = %name, %key, %path, size, "blob archived");
            record.blobs.push(BlobRecord {
                id: key,
                size,
                sha256,
                path,
            });
        }
        Ok(record)
    }
}
