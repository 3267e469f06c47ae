//! Two-phase restore.
//!
//! **Phase A** stages the incoming archive into a local temporary file,
//! decodes `index.json`, checks every blob id against the destination
//! store's key rules and rehashes every member against the manifest.
//! Nothing outside the staging file is written; any failure here leaves
//! every store untouched.
//!
//! **Phase B** replaces stores one at a time, in manifest order: every
//! existing entry is deleted, then every archived blob is written under
//! its original id. A failure here is reported as
//! [`BackupError::PartialRestore`]: stores applied earlier stay restored,
//! the failing store may be partially repopulated, later stores are not
//! touched. There is no rollback. Stores absent from the archive are never
//! touched.

use crate::engine::{BackupEngine, RestoreSummary};
use crate::error::{BackupError, BackupResult};
use crate::hashing::HashingWriter;
use crate::manifest::{BackupIndex, BlobRecord, StoreRecord, INDEX_NAME};
use crate::subject::{authorize, Permission, Subject};
use blobkit_storage::{Context, ListOptions, StorageError, StorageResult};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, Write};
use std::time::Instant;
use tracing::{debug, error, info};
use zip::result::ZipError;
use zip::ZipArchive;

/// A validated archive awaiting phase B.
struct Staged {
    archive: ZipArchive<BufReader<File>>,
    index: BackupIndex,
}

impl BackupEngine {
    /// Replaces store contents with the contents of the archive read from
    /// `source`.
    ///
    /// The subject must hold [`Permission::Restore`].
    ///
    /// # Errors
    ///
    /// - [`BackupError::Unauthorized`] before any I/O
    /// - format and integrity errors from phase A; no store was modified
    /// - [`BackupError::PartialRestore`] if phase B fails
    pub fn restore<R: Read>(
        &self,
        ctx: &Context,
        subject: &dyn Subject,
        source: R,
    ) -> BackupResult<RestoreSummary> {
        authorize(subject, Permission::Restore)?;
        let started = Instant::now();
        info!(subject = %subject.describe(), "restore started");

        let mut staged = self.stage_and_validate(ctx, source)?;
        info!(
            stores = staged.index.stores.len(),
            blobs = staged.index.blob_count(),
            "archive validated, replacing stores"
        );

        let summary = self.apply(ctx, &mut staged)?;
        info!(
            stores = summary.stores,
            blobs = summary.blobs,
            bytes = summary.bytes,
            deleted = summary.deleted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "restore finished"
        );
        Ok(summary)
    }

    /// Runs phase A only: stages, decodes and fully validates the archive.
    ///
    /// No store is opened or modified, so no permission is required.
    ///
    /// # Errors
    ///
    /// Returns the same format and integrity errors as
    /// [`restore`](Self::restore).
    pub fn inspect<R: Read>(&self, ctx: &Context, source: R) -> BackupResult<BackupIndex> {
        Ok(self.stage_and_validate(ctx, source)?.index)
    }

    fn stage_and_validate<R: Read>(&self, ctx: &Context, source: R) -> BackupResult<Staged> {
        let file = self.stage(ctx, source)?;
        let mut archive = ZipArchive::new(BufReader::new(file))?;
        let index = self.read_index(&mut archive)?;

        for record in &index.stores {
            for blob in &record.blobs {
                ctx.check()?;
                self.check_destination_key(record, blob)?;
                verify_member(&mut archive, record, blob)?;
            }
        }
        Ok(Staged { archive, index })
    }

    fn check_destination_key(&self, record: &StoreRecord, blob: &BlobRecord) -> BackupResult<()> {
        match self.check_key(record.stereotype, &record.name, &blob.id) {
            Ok(()) => Ok(()),
            Err(StorageError::InvalidKey { reason, .. }) => Err(BackupError::UnsupportedKey {
                store: record.name.clone(),
                id: blob.id.clone(),
                reason,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Copies the whole upload into an anonymous temporary file.
    fn stage<R: Read>(&self, ctx: &Context, mut source: R) -> BackupResult<File> {
        let config = &self.restore_config;
        let mut file = match &config.staging_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };

        let mut buf = vec![0u8; config.buffer_size.max(1)];
        let mut staged = 0u64;
        loop {
            ctx.check()?;
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            file.write_all(&buf[..n])?;
            staged += n as u64;
        }
        file.flush()?;
        file.rewind()?;

        debug!(bytes = staged, "archive staged");
        Ok(file)
    }

    fn read_index<R: Read + Seek>(&self, archive: &mut ZipArchive<R>) -> BackupResult<BackupIndex> {
        let limit = self.restore_config.max_manifest_size;
        let member = match archive.by_name(INDEX_NAME) {
            Ok(member) => member,
            Err(ZipError::FileNotFound) => {
                return Err(BackupError::invalid_format(format!(
                    "archive has no {INDEX_NAME}"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if member.size() > limit {
            return Err(BackupError::invalid_format(format!(
                "{INDEX_NAME} is {} bytes, limit is {limit}",
                member.size()
            )));
        }

        let mut data = Vec::new();
        member
            .take(limit.saturating_add(1))
            .read_to_end(&mut data)
            .map_err(|e| BackupError::invalid_format(format!("unreadable {INDEX_NAME}: {e}")))?;
        if data.len() as u64 > limit {
            return Err(BackupError::invalid_format(format!(
                "{INDEX_NAME} exceeds {limit} bytes"
            )));
        }
        BackupIndex::from_json(&data)
    }

    fn apply(&self, ctx: &Context, staged: &mut Staged) -> BackupResult<RestoreSummary> {
        let mut summary = RestoreSummary {
            created_at: staged.index.created_at,
            stores: 0,
            blobs: 0,
            bytes: 0,
            deleted: 0,
        };
        let mut completed = Vec::new();

        for record in &staged.index.stores {
            match self.apply_store(ctx, &mut staged.archive, record) {
                Ok(deleted) => {
                    info!(
                        store = %record.name,
                        stereotype = %record.stereotype,
                        blobs = record.blobs.len(),
                        deleted,
                        "store restored"
                    );
                    summary.stores += 1;
                    summary.blobs += record.blobs.len();
                    summary.bytes += record.total_bytes();
                    summary.deleted += deleted;
                    completed.push(record.name.clone());
                }
                Err(source) => {
                    error!(
                        store = %record.name,
                        error = %source,
                        completed = completed.len(),
                        "restore failed while replacing store"
                    );
                    return Err(BackupError::PartialRestore {
                        store: record.name.clone(),
                        completed,
                        source: Box::new(source),
                    });
                }
            }
        }
        Ok(summary)
    }

    /// Replaces one store's contents. Returns how many entries were deleted.
    fn apply_store<R: Read + Seek>(
        &self,
        ctx: &Context,
        archive: &mut ZipArchive<R>,
        record: &StoreRecord,
    ) -> BackupResult<usize> {
        ctx.check()?;
        let store = self.open_store(record.stereotype, &record.name)?;

        let existing = store
            .list(ctx, &ListOptions::new())?
            .collect::<StorageResult<Vec<String>>>()?;
        for key in &existing {
            store.delete(ctx, key)?;
        }

        for blob in &record.blobs {
            ctx.check()?;
            let mut member = archive.by_name(&blob.path)?;
            let mut hashing = HashingWriter::new(store.writer(ctx, &blob.id)?);
            io::copy(&mut member, &mut hashing)?;
            let (writer, size, sha256) = hashing.finish();
            if size != blob.size {
                return Err(BackupError::mismatch(&record.name, &blob.id, "size", blob.size, size));
            }
            if sha256 != blob.sha256 {
                return Err(BackupError::mismatch(
                    &record.name,
                    &blob.id,
                    "sha256",
                    &blob.sha256,
                    sha256,
                ));
            }
            writer.commit()?;
            debug!(store = %record.name, id = %blob.id, size, "blob restored");
        }
        Ok(existing.len())
    }
}

/// Rehashes one member and compares it with its manifest entry.
fn verify_member<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    record: &StoreRecord,
    blob: &BlobRecord,
) -> BackupResult<()> {
    let corrupt = |reason: String| BackupError::CorruptMember {
        store: record.name.clone(),
        id: blob.id.clone(),
        path: blob.path.clone(),
        reason,
    };

    let mut member = match archive.by_name(&blob.path) {
        Ok(member) => member,
        Err(ZipError::FileNotFound) => {
            return Err(BackupError::MissingMember {
                store: record.name.clone(),
                id: blob.id.clone(),
                path: blob.path.clone(),
            })
        }
        Err(e) => return Err(corrupt(e.to_string())),
    };

    // Read at most one byte past the recorded size so an oversized member
    // can't stream unbounded data.
    let mut hashing = HashingWriter::new(io::sink());
    io::copy(
        &mut member.by_ref().take(blob.size.saturating_add(1)),
        &mut hashing,
    )
    .map_err(|e| corrupt(e.to_string()))?;
    let (_, size, sha256) = hashing.finish();

    if size != blob.size {
        return Err(BackupError::mismatch(&record.name, &blob.id, "size", blob.size, size));
    }
    if sha256 != blob.sha256 {
        return Err(BackupError::mismatch(
            &record.name,
            &blob.id,
            "sha256",
            &blob.sha256,
            sha256,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::sha256_hex;
    use crate::manifest::Stereotype;
    use crate::{ErrorKind, RestoreConfig};
    use blobkit_storage::{BackendKind, RegistryConfig, Store, StoreProvider, StoreRegistry};
    use chrono::Utc;
    use std::io::Cursor;
    use std::sync::Arc;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    struct Admin;

    impl Subject for Admin {
        fn describe(&self) -> String {
            "admin".to_string()
        }

        fn is_allowed(&self, _: Permission) -> bool {
            true
        }
    }

    fn engine() -> (Arc<StoreRegistry>, BackupEngine) {
        let registry = Arc::new(StoreRegistry::open(RegistryConfig::in_memory()).unwrap());
        let engine = BackupEngine::new(registry.clone());
        (registry, engine)
    }

    /// Builds an archive from raw members, manifest included.
    fn archive(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in members {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn manifest_for(store: &str, blobs: &[(&str, &[u8], &str)]) -> Vec<u8> {
        let mut record = StoreRecord::new(store, Stereotype::Document);
        for (id, data, path) in blobs {
            record.blobs.push(BlobRecord {
                id: (*id).to_string(),
                size: data.len() as u64,
                sha256: sha256_hex(data),
                path: (*path).to_string(),
            });
        }
        let mut index = BackupIndex::new(Utc::now());
        index.stores.push(record);
        index.to_json().unwrap()
    }

    #[test]
    fn restore_requires_index() {
        let (_, engine) = engine();
        let bytes = archive(&[("data/0", b"x")]);
        let err = engine
            .restore(&Context::background(), &Admin, Cursor::new(bytes))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn restore_rejects_non_zip() {
        let (_, engine) = engine();
        let err = engine
            .restore(&Context::background(), &Admin, Cursor::new(b"not a zip".to_vec()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn restore_missing_member_changes_nothing() {
        let (registry, engine) = engine();
        let ctx = Context::background();
        registry.entity_store("users").unwrap().put(&ctx, "old", b"keep").unwrap();

        let manifest = manifest_for("users", &[("x", b"{}", "data/0")]);
        let bytes = archive(&[(INDEX_NAME, &manifest)]);
        let err = engine.restore(&ctx, &Admin, Cursor::new(bytes)).unwrap_err();

        assert!(matches!(err, BackupError::MissingMember { .. }));
        assert_eq!(err.kind(), ErrorKind::Integrity);
        let users = registry.entity_store("users").unwrap();
        assert_eq!(users.get(&ctx, "old").unwrap().unwrap(), b"keep");
    }

    #[test]
    fn restore_digest_mismatch_changes_nothing() {
        let (registry, engine) = engine();
        let ctx = Context::background();
        registry.entity_store("users").unwrap().put(&ctx, "old", b"keep").unwrap();

        let manifest = manifest_for("users", &[("x", b"{\"a\":\"1\"}", "data/0")]);
        let bytes = archive(&[("data/0", b"{\"a\":\"2\"}"), (INDEX_NAME, &manifest)]);
        let err = engine.restore(&ctx, &Admin, Cursor::new(bytes)).unwrap_err();

        assert!(matches!(
            err,
            BackupError::IntegrityMismatch { field: "sha256", .. }
        ));
        let users = registry.entity_store("users").unwrap();
        assert!(!users.exists(&ctx, "x").unwrap());
        assert!(users.exists(&ctx, "old").unwrap());
    }

    #[test]
    fn restore_rejects_keys_destination_cannot_hold() {
        let dir = tempfile::tempdir().unwrap();
        let config = RegistryConfig::new(dir.path()).entity_backend(BackendKind::FlatFile);
        let registry = Arc::new(StoreRegistry::open(config).unwrap());
        let engine = BackupEngine::new(registry.clone());
        let ctx = Context::background();
        registry.entity_store("users").unwrap().put(&ctx, "old", b"keep").unwrap();

        let long_id = "k".repeat(200);
        let manifest = manifest_for(
            "users",
            &[("a", b"1", "data/0"), (long_id.as_str(), b"2", "data/1")],
        );
        let bytes = archive(&[("data/0", b"1"), ("data/1", b"2"), (INDEX_NAME, &manifest)]);
        let err = engine.restore(&ctx, &Admin, Cursor::new(bytes)).unwrap_err();

        assert!(matches!(err, BackupError::UnsupportedKey { ref id, .. } if *id == long_id));
        assert_eq!(err.kind(), ErrorKind::Format);
        let users = registry.entity_store("users").unwrap();
        assert_eq!(users.get(&ctx, "old").unwrap().unwrap(), b"keep");
        assert!(!users.exists(&ctx, "a").unwrap());
    }

    #[test]
    fn restore_size_mismatch_detected() {
        let (_, engine) = engine();
        let manifest = manifest_for("users", &[("x", b"short", "data/0")]);
        let bytes = archive(&[("data/0", b"much longer"), (INDEX_NAME, &manifest)]);
        let err = engine
            .restore(&Context::background(), &Admin, Cursor::new(bytes))
            .unwrap_err();
        assert!(matches!(err, BackupError::IntegrityMismatch { field: "size", .. }));
    }

    #[test]
    fn restore_replaces_store_contents() {
        let (registry, engine) = engine();
        let ctx = Context::background();
        registry.entity_store("users").unwrap().put(&ctx, "old", b"gone").unwrap();
        registry.entity_store("other").unwrap().put(&ctx, "k", b"untouched").unwrap();

        let manifest = manifest_for("users", &[("x", b"{\"a\":\"1\"}", "data/0")]);
        let bytes = archive(&[("data/0", b"{\"a\":\"1\"}"), (INDEX_NAME, &manifest)]);
        let summary = engine.restore(&ctx, &Admin, Cursor::new(bytes)).unwrap();

        assert_eq!(summary.stores, 1);
        assert_eq!(summary.blobs, 1);
        assert_eq!(summary.deleted, 1);
        let users = registry.entity_store("users").unwrap();
        assert!(!users.exists(&ctx, "old").unwrap());
        assert_eq!(users.get(&ctx, "x").unwrap().unwrap(), b"{\"a\":\"1\"}");
        let other = registry.entity_store("other").unwrap();
        assert_eq!(other.get(&ctx, "k").unwrap().unwrap(), b"untouched");
    }

    #[test]
    fn restore_manifest_size_limit() {
        let registry = Arc::new(StoreRegistry::open(RegistryConfig::in_memory()).unwrap());
        let engine = BackupEngine::new(registry)
            .with_restore_config(RestoreConfig::new().max_manifest_size(16));
        let manifest = manifest_for("users", &[]);
        let bytes = archive(&[(INDEX_NAME, &manifest)]);

        let err = engine.inspect(&Context::background(), Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn restore_cancelled_before_staging() {
        let (_, engine) = engine();
        let ctx = Context::background();
        ctx.cancel();
        let manifest = manifest_for("users", &[]);
        let bytes = archive(&[(INDEX_NAME, &manifest)]);
        assert!(engine.restore(&ctx, &Admin, Cursor::new(bytes)).unwrap_err().is_cancelled());
    }

    #[test]
    fn inspect_returns_validated_index() {
        let (registry, engine) = engine();
        let manifest = manifest_for("users", &[("x", b"1", "data/0")]);
        let bytes = archive(&[("data/0", b"1"), (INDEX_NAME, &manifest)]);

        let index = engine.inspect(&Context::background(), Cursor::new(bytes)).unwrap();
        assert_eq!(index.blob_count(), 1);
        assert_eq!(registry.entity_stores().count(), 0);
    }

    #[test]
    fn stage_uses_configured_dir() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(StoreRegistry::open(RegistryConfig::in_memory()).unwrap());
        let engine = BackupEngine::new(registry)
            .with_restore_config(RestoreConfig::new().staging_dir(dir.path()).buffer_size(7));
        let manifest = manifest_for("users", &[("x", b"abc", "data/0")]);
        let bytes = archive(&[("data/0", b"abc"), (INDEX_NAME, &manifest)]);

        assert!(engine.inspect(&Context::background(), Cursor::new(bytes)).is_ok());
    }
}
