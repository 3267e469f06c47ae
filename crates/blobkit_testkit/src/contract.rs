//! Behavioural checks every [`Store`] implementation must pass.
//!
//! Each check panics with a descriptive message on the first violation.
//! Run [`check_store_contract`] against a fresh, empty store.

use crate::generators::StoreOperation;
use blobkit_storage::{Context, ListOptions, StorageError, Store};
use std::collections::BTreeMap;
use std::io::Write;

/// Runs every contract check against an empty store.
pub fn check_store_contract(store: &dyn Store) {
    check_absent_key(store);
    check_round_trip(store);
    check_overwrite(store);
    check_idempotent_delete(store);
    check_uncommitted_writer_discarded(store);
    check_cancelled_commit_discarded(store);
    check_empty_key_rejected(store);
    check_list_filters(store, true);
}

/// Absence is `None`, never an error.
pub fn check_absent_key(store: &dyn Store) {
    let ctx = Context::background();
    assert!(
        store.reader(&ctx, "contract/absent").unwrap().is_none(),
        "reader for an absent key must be None"
    );
    assert!(!store.exists(&ctx, "contract/absent").unwrap());
}

/// `write(k, v); read(k) == Some(v)`.
pub fn check_round_trip(store: &dyn Store) {
    let ctx = Context::background();
    store.put(&ctx, "contract/rt", b"round trip").unwrap();
    assert_eq!(
        store.get(&ctx, "contract/rt").unwrap().as_deref(),
        Some(&b"round trip"[..]),
        "value must read back unchanged"
    );
    assert!(store.exists(&ctx, "contract/rt").unwrap());
    store.delete(&ctx, "contract/rt").unwrap();
}

/// A second write replaces the first.
pub fn check_overwrite(store: &dyn Store) {
    let ctx = Context::background();
    store.put(&ctx, "contract/ow", b"first").unwrap();
    store.put(&ctx, "contract/ow", b"second, longer").unwrap();
    assert_eq!(
        store.get(&ctx, "contract/ow").unwrap().as_deref(),
        Some(&b"second, longer"[..])
    );
    store.delete(&ctx, "contract/ow").unwrap();
}

/// Deleting an absent key succeeds, twice.
pub fn check_idempotent_delete(store: &dyn Store) {
    let ctx = Context::background();
    store.put(&ctx, "contract/del", b"x").unwrap();
    store.delete(&ctx, "contract/del").unwrap();
    store.delete(&ctx, "contract/del").unwrap();
    store.delete(&ctx, "contract/never-written").unwrap();
    assert!(!store.exists(&ctx, "contract/del").unwrap());
}

/// A writer dropped before commit publishes nothing.
pub fn check_uncommitted_writer_discarded(store: &dyn Store) {
    let ctx = Context::background();
    store.put(&ctx, "contract/drop", b"old").unwrap();
    {
        let mut writer = store.writer(&ctx, "contract/drop").unwrap();
        writer.write_all(b"new").unwrap();
    }
    assert_eq!(
        store.get(&ctx, "contract/drop").unwrap().as_deref(),
        Some(&b"old"[..]),
        "dropped writer must not replace the value"
    );
    store.delete(&ctx, "contract/drop").unwrap();
}

/// A writer whose context is cancelled before commit publishes nothing.
pub fn check_cancelled_commit_discarded(store: &dyn Store) {
    let ctx = Context::background();
    let mut writer = store.writer(&ctx, "contract/cancel").unwrap();
    writer.write_all(b"abandoned").unwrap();
    ctx.cancel();
    let result = writer.commit();
    assert!(
        matches!(result, Err(StorageError::Cancelled)),
        "commit after cancel must fail with Cancelled, got {result:?}"
    );

    let fresh = Context::background();
    assert!(
        !store.exists(&fresh, "contract/cancel").unwrap(),
        "cancelled writer must not publish"
    );
}

/// Empty keys are rejected.
pub fn check_empty_key_rejected(store: &dyn Store) {
    let ctx = Context::background();
    assert!(matches!(
        store.put(&ctx, "", b"x"),
        Err(StorageError::InvalidKey { .. })
    ));
}

/// Prefix and inclusive range filters; `ordered` also checks ascending order.
pub fn check_list_filters(store: &dyn Store, ordered: bool) {
    let ctx = Context::background();
    let keys = ["list/a", "list/b", "list/c", "list/d", "other/a"];
    for key in keys {
        store.put(&ctx, key, key.as_bytes()).unwrap();
    }

    let collect = |opts: ListOptions| -> Vec<String> {
        let mut found: Vec<String> = store
            .list(&ctx, &opts)
            .unwrap()
            .map(|k| k.unwrap())
            .filter(|k| k.starts_with("list/") || k.starts_with("other/"))
            .collect();
        if !ordered {
            found.sort();
        }
        found
    };

    assert_eq!(collect(ListOptions::new().prefix("list/")).len(), 4);
    assert_eq!(
        collect(ListOptions::new().min_key("list/b").max_key("list/c")),
        vec!["list/b", "list/c"]
    );
    assert_eq!(
        collect(ListOptions::new().prefix("list/").min_key("list/c")),
        vec!["list/c", "list/d"]
    );
    assert_eq!(collect(ListOptions::new().prefix("zzz")).len(), 0);
    let all = collect(ListOptions::new());
    assert_eq!(all.len(), 5);
    if ordered {
        let mut sorted = all.clone();
        sorted.sort();
        assert_eq!(all, sorted, "ordered backend must list ascending");
    }

    for key in keys {
        store.delete(&ctx, key).unwrap();
    }
}

/// Applies `ops` to `store` and to a model map, checking every read.
pub fn check_against_model(store: &dyn Store, ops: &[StoreOperation]) {
    let ctx = Context::background();
    let mut model: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for op in ops {
        match op {
            StoreOperation::Put { key, value } => {
                store.put(&ctx, key, value).unwrap();
                model.insert(key.clone(), value.clone());
            }
            StoreOperation::Delete { key } => {
                store.delete(&ctx, key).unwrap();
                model.remove(key);
            }
            StoreOperation::Get { key } => {
                assert_eq!(store.get(&ctx, key).unwrap().as_ref(), model.get(key));
            }
        }
    }

    let mut listed: Vec<String> = store
        .list(&ctx, &ListOptions::new())
        .unwrap()
        .map(|k| k.unwrap())
        .collect();
    listed.sort();
    assert_eq!(listed, model.keys().cloned().collect::<Vec<_>>());
}
