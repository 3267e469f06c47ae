//! Backup and restore commands.
//!
//! Every command goes through [`BackupEngine`]; the CLI acts as a local
//! operator holding both permissions.

use blobkit_backup::{BackupEngine, BackupIndex, BackupSummary, Permission, Subject};
use blobkit_storage::{Context, RegistryConfig, StoreRegistry};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Whoever runs the CLI against a local registry.
struct LocalOperator;

impl Subject for LocalOperator {
    fn describe(&self) -> String {
        "local operator".to_string()
    }

    fn is_allowed(&self, _permission: Permission) -> bool {
        true
    }
}

/// Backs up every store of `registry` into `output_path`.
pub fn create(
    registry: StoreRegistry,
    output_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Backing up {:?}", registry.root());

    let registry = Arc::new(registry);
    let engine = BackupEngine::new(registry.clone());

    let summary = write_archive(&engine, &Context::background(), output_path)?;
    registry.close()?;

    println!("✓ Backup created successfully");
    println!("  Path: {:?}", output_path);
    println!("  Stores: {}", summary.stores);
    println!("  Blobs: {}", summary.blobs);
    println!("  Bytes: {}", summary.bytes);
    if summary.skipped > 0 {
        println!("  Skipped (deleted during backup): {}", summary.skipped);
    }
    println!("  Created: {}", summary.created_at.to_rfc3339());

    Ok(())
}

/// Backs up into a temporary file next to `output_path` and renames it
/// into place once the archive is complete and synced. On failure the
/// temporary file is removed and any existing `output_path` is kept.
fn write_archive(
    engine: &BackupEngine,
    ctx: &Context,
    output_path: &Path,
) -> Result<BackupSummary, Box<dyn std::error::Error>> {
    let dir = match output_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let partial = tempfile::Builder::new()
        .prefix(".blobkit-backup-")
        .suffix(".partial")
        .tempfile_in(dir)?;

    let mut sink = BufWriter::new(partial);
    let summary = engine.backup(ctx, &LocalOperator, &mut sink)?;
    let partial = sink.into_inner().map_err(|e| e.into_error())?;
    partial.as_file().sync_all()?;
    partial.persist(output_path).map_err(|e| e.error)?;

    Ok(summary)
}

/// Replaces the stores named in `input_path` with the archived contents.
pub fn restore(
    registry: StoreRegistry,
    input_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Restoring {:?} from {:?}", registry.root(), input_path);

    let registry = Arc::new(registry);
    let engine = BackupEngine::new(registry.clone());

    let source = BufReader::new(File::open(input_path)?);
    let summary = engine.restore(&Context::background(), &LocalOperator, source)?;

    registry.close()?;

    println!("✓ Registry restored successfully");
    println!("  Stores replaced: {}", summary.stores);
    println!("  Blobs written: {}", summary.blobs);
    println!("  Bytes written: {}", summary.bytes);
    println!("  Entries removed: {}", summary.deleted);
    println!("  From backup created: {}", summary.created_at.to_rfc3339());

    Ok(())
}

/// Validates an archive without restoring it.
pub fn verify(input_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating backup {:?}", input_path);

    match read_index(input_path) {
        Ok(index) => {
            println!("✓ Backup is valid");
            print_index(&index, &mut std::io::stdout())?;
            Ok(())
        }
        Err(e) => {
            println!("✗ Backup is invalid or corrupted");
            Err(e)
        }
    }
}

/// Shows the manifest of an archive.
pub fn info(input_path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    info!("Reading backup info from {:?}", input_path);

    let index = read_index(input_path)?;
    match format {
        "json" => {
            let stores: Vec<_> = index
                .stores
                .iter()
                .map(|store| {
                    serde_json::json!({
                        "name": store.name,
                        "stereotype": store.stereotype,
                        "blobs": store.blobs.len(),
                        "bytes": store.total_bytes(),
                    })
                })
                .collect();
            let summary = serde_json::json!({
                "createdAt": index.created_at,
                "blobs": index.blob_count(),
                "bytes": index.total_bytes(),
                "stores": stores,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        _ => {
            println!("Backup Information");
            println!("==================");
            print_index(&index, &mut std::io::stdout())?;
        }
    }

    Ok(())
}

/// Runs phase A only; no registry is touched.
fn read_index(input_path: &Path) -> Result<BackupIndex, Box<dyn std::error::Error>> {
    let scratch = Arc::new(StoreRegistry::open(RegistryConfig::in_memory())?);
    let engine = BackupEngine::new(scratch);
    let source = BufReader::new(File::open(input_path)?);
    Ok(engine.inspect(&Context::background(), source)?)
}

fn print_index(index: &BackupIndex, out: &mut impl Write) -> std::io::Result<()> {
    writeln!(out, "  Created: {}", index.created_at.to_rfc3339())?;
    writeln!(out, "  Stores: {}", index.stores.len())?;
    writeln!(out, "  Blobs: {}", index.blob_count())?;
    writeln!(out, "  Bytes: {}", index.total_bytes())?;
    for store in &index.stores {
        writeln!(
            out,
            "    {} ({}): {} blobs, {} bytes",
            store.name,
            store.stereotype,
            store.blobs.len(),
            store.total_bytes()
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobkit_backup::{BlobRecord, Stereotype, StoreRecord};
    use blobkit_storage::{Store, StoreProvider};

    fn open(root: &Path) -> StoreRegistry {
        StoreRegistry::open(RegistryConfig::new(root)).unwrap()
    }

    #[test]
    fn backup_command_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("out.zip");
        let ctx = Context::background();

        {
            let source = open(&dir.path().join("source"));
            let users = source.entity_store("users").unwrap();
            users.put(&ctx, "x", br#"{"a":"1"}"#).unwrap();
            let uploads = source.file_store("uploads").unwrap();
            uploads.put(&ctx, "y", b"blob").unwrap();
            create(source, &archive).unwrap();
        }

        verify(&archive).unwrap();
        let index = read_index(&archive).unwrap();
        assert_eq!(index.blob_count(), 2);

        let target_root = dir.path().join("target");
        restore(open(&target_root), &archive).unwrap();
        let target = open(&target_root);
        assert_eq!(
            target.file_store("uploads").unwrap().get(&ctx, "y").unwrap().unwrap(),
            b"blob"
        );
    }

    #[test]
    fn backup_command_failure_keeps_previous_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("out.zip");
        std::fs::write(&archive, b"previous archive").unwrap();

        let registry = Arc::new(StoreRegistry::open(RegistryConfig::in_memory()).unwrap());
        let ctx = Context::background();
        registry.entity_store("users").unwrap().put(&ctx, "x", b"{}").unwrap();
        let engine = BackupEngine::new(registry);

        let cancelled = Context::background();
        cancelled.cancel();
        assert!(write_archive(&engine, &cancelled, &archive).is_err());

        assert_eq!(std::fs::read(&archive).unwrap(), b"previous archive");
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1, "temporary archive left behind");

        let summary = write_archive(&engine, &ctx, &archive).unwrap();
        assert_eq!(summary.blobs, 1);
        assert_eq!(read_index(&archive).unwrap().blob_count(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn backup_command_verify_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.zip");
        std::fs::write(&path, b"not a zip archive").unwrap();
        assert!(verify(&path).is_err());
        assert!(info(&path, "text").is_err());
    }

    #[test]
    fn backup_command_prints_index() {
        let mut index = BackupIndex::new(chrono::Utc::now());
        let mut store = StoreRecord::new("users", Stereotype::Document);
        store.blobs.push(BlobRecord {
            id: "x".to_string(),
            size: 3,
            sha256: "0".repeat(64),
            path: "data/0".to_string(),
        });
        index.stores.push(store);

        let mut out = Vec::new();
        print_index(&index, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Blobs: 1"));
        assert!(text.contains("users (document): 1 blobs, 3 bytes"));
    }
}
