//! Garbage collection command.

use blobkit_storage::{Context, StoreRegistry};
use tracing::info;

/// Collects unreferenced blobs in every content-addressed store.
pub fn run(registry: &StoreRegistry) -> Result<(), Box<dyn std::error::Error>> {
    info!("Collecting garbage under {:?}", registry.root());

    let results = registry.collect_garbage(&Context::background())?;
    if results.is_empty() {
        println!("No content-addressed stores found");
        return Ok(());
    }

    let mut freed = 0u64;
    for (store, stats) in &results {
        println!(
            "  {store}: {} unreferenced, {} orphans, {} bytes freed",
            stats.unreferenced_removed, stats.orphans_removed, stats.bytes_freed
        );
        freed += stats.bytes_freed;
    }
    println!("✓ Collected {} stores, {freed} bytes freed", results.len());

    Ok(())
}
