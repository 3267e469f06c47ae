//! Backup manifest.
//!
//! Every archive carries an `index.json` member describing its contents:
//!
//! ```json
//! {
//!   "createdAt": "2024-05-01T12:00:00Z",
//!   "stores": [
//!     {
//!       "name": "users",
//!       "stereotype": "document",
//!       "blobs": [{ "id": "u1", "size": 12, "sha256": "…", "path": "data/0" }]
//!     }
//!   ]
//! }
//! ```

use crate::error::{BackupError, BackupResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Name of the manifest member.
pub const INDEX_NAME: &str = "index.json";

/// Directory prefix of blob members.
pub const DATA_PREFIX: &str = "data/";

/// Returns the archive path of the `n`th blob written.
#[must_use]
pub fn data_path(n: u64) -> String {
    format!("{DATA_PREFIX}{n}")
}

/// What kind of store a record was exported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stereotype {
    /// An entity store holding small documents.
    Document,
    /// A file store holding large blobs.
    Blob,
}

impl Stereotype {
    /// Returns the stereotype's manifest name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Blob => "blob",
        }
    }
}

impl std::fmt::Display for Stereotype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One archived value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    /// The value's key in its store.
    pub id: String,
    /// Length in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the value.
    pub sha256: String,
    /// Archive member holding the value.
    pub path: String,
}

/// One archived store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRecord {
    /// Store name.
    pub name: String,
    /// Which kind of store to restore into.
    pub stereotype: Stereotype,
    /// Archived values, in export order.
    #[serde(default)]
    pub blobs: Vec<BlobRecord>,
}

impl StoreRecord {
    /// Creates an empty record.
    #[must_use]
    pub fn new(name: impl Into<String>, stereotype: Stereotype) -> Self {
        Self {
            name: name.into(),
            stereotype,
            blobs: Vec::new(),
        }
    }

    /// Total bytes of every blob in the record.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.blobs.iter().map(|b| b.size).sum()
    }
}

/// The manifest of one backup run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupIndex {
    /// When the backup started.
    pub created_at: DateTime<Utc>,
    /// Archived stores: file stores first, then entity stores.
    pub stores: Vec<StoreRecord>,
}

impl BackupIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            stores: Vec::new(),
        }
    }

    /// Number of blobs across all stores.
    #[must_use]
    pub fn blob_count(&self) -> usize {
        self.stores.iter().map(|s| s.blobs.len()).sum()
    }

    /// Bytes across all stores.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.stores.iter().map(StoreRecord::total_bytes).sum()
    }

    /// Serializes to pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> BackupResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decodes and structurally validates a manifest.
    ///
    /// # Errors
    ///
    /// Returns a format error if the JSON is malformed, names an unknown
    /// stereotype, or fails [`validate`](Self::validate).
    pub fn from_json(data: &[u8]) -> BackupResult<Self> {
        let index: Self = serde_json::from_slice(data)?;
        index.validate()?;
        Ok(index)
    }

    /// Checks the manifest's internal consistency.
    ///
    /// Rejects invalid or duplicate store names, empty or duplicate ids
    /// within a store, malformed digests, and archive paths that are empty,
    /// shared between blobs, or collide with the manifest itself.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError::InvalidFormat`] describing the first problem.
    pub fn validate(&self) -> BackupResult<()> {
        let mut store_names = HashSet::new();
        let mut paths = HashSet::new();

        for store in &self.stores {
            blobkit_storage::validate_store_name(&store.name).map_err(|e| {
                BackupError::invalid_format(format!("store record: {e}"))
            })?;
            if !store_names.insert((store.stereotype, store.name.as_str())) {
                return Err(BackupError::invalid_format(format!(
                    "duplicate {} store record {:?}",
                    store.stereotype, store.name
                )));
            }

            let mut ids = HashSet::new();
            for blob in &store.blobs {
                if blob.id.is_empty() {
                    return Err(BackupError::invalid_format(format!(
                        "store {:?} has a blob with an empty id",
                        store.name
                    )));
                }
                if !ids.insert(blob.id.as_str()) {
                    return Err(BackupError::invalid_format(format!(
                        "store {:?} lists id {:?} twice",
                        store.name, blob.id
                    )));
                }
                if blob.sha256.len() != 64
                    || !blob.sha256.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
                {
                    return Err(BackupError::invalid_format(format!(
                        "blob {:?} of store {:?} has a malformed digest",
                        blob.id, store.name
                    )));
                }
                if blob.path.is_empty() || blob.path == INDEX_NAME {
                    return Err(BackupError::invalid_format(format!(
                        "blob {:?} of store {:?} has invalid archive path {:?}",
                        blob.id, store.name, blob.path
                    )));
                }
                if !paths.insert(blob.path.as_str()) {
                    return Err(BackupError::invalid_format(format!(
                        "archive path {:?} is claimed by more than one blob",
                        blob.path
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn blob(id: &str, path: &str) -> BlobRecord {
        BlobRecord {
            id: id.to_string(),
            size: 0,
            sha256: DIGEST.to_string(),
            path: path.to_string(),
        }
    }

    fn index_with(stores: Vec<StoreRecord>) -> BackupIndex {
        BackupIndex {
            created_at: Utc::now(),
            stores,
        }
    }

    #[test]
    fn manifest_json_shape() {
        let mut store = StoreRecord::new("users", Stereotype::Document);
        store.blobs.push(blob("x", "data/0"));
        let index = index_with(vec![store]);

        let value: serde_json::Value = serde_json::from_slice(&index.to_json().unwrap()).unwrap();
        assert!(value["createdAt"].is_string());
        assert_eq!(value["stores"][0]["stereotype"], "document");
        assert_eq!(value["stores"][0]["blobs"][0]["sha256"], DIGEST);
        assert_eq!(value["stores"][0]["blobs"][0]["path"], "data/0");
        assert_eq!(value["stores"][0]["blobs"][0]["size"], 0);

        let decoded = BackupIndex::from_json(&index.to_json().unwrap()).unwrap();
        assert_eq!(decoded, index);
    }

    #[test]
    fn manifest_parses_external_json() {
        let json = format!(
            r#"{{"createdAt":"2024-05-01T12:00:00Z","stores":[{{"name":"avatars","stereotype":"blob","blobs":[{{"id":"a","size":3,"sha256":"{DIGEST}","path":"data/7"}}]}}]}}"#
        );
        let index = BackupIndex::from_json(json.as_bytes()).unwrap();
        assert_eq!(index.stores[0].stereotype, Stereotype::Blob);
        assert_eq!(index.blob_count(), 1);
        assert_eq!(index.total_bytes(), 3);
        assert_eq!(index.created_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn manifest_unknown_stereotype_rejected() {
        let json = r#"{"createdAt":"2024-05-01T12:00:00Z","stores":[{"name":"s","stereotype":"table","blobs":[]}]}"#;
        let err = BackupIndex::from_json(json.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Format);
    }

    #[test]
    fn manifest_negative_size_rejected() {
        let json = format!(
            r#"{{"createdAt":"2024-05-01T12:00:00Z","stores":[{{"name":"s","stereotype":"blob","blobs":[{{"id":"a","size":-1,"sha256":"{DIGEST}","path":"data/0"}}]}}]}}"#
        );
        assert!(BackupIndex::from_json(json.as_bytes()).is_err());
    }

    #[test]
    fn manifest_validation_rejects_duplicates() {
        let mut a = StoreRecord::new("s", Stereotype::Blob);
        a.blobs.push(blob("x", "data/0"));
        a.blobs.push(blob("x", "data/1"));
        assert!(index_with(vec![a]).validate().is_err());

        let mut b = StoreRecord::new("s", Stereotype::Blob);
        b.blobs.push(blob("x", "data/0"));
        let mut c = StoreRecord::new("t", Stereotype::Blob);
        c.blobs.push(blob("y", "data/0"));
        assert!(index_with(vec![b, c]).validate().is_err());

        let d = StoreRecord::new("s", Stereotype::Document);
        let e = StoreRecord::new("s", Stereotype::Document);
        assert!(index_with(vec![d, e]).validate().is_err());

        // Same name under both stereotypes is two different stores.
        let f = StoreRecord::new("s", Stereotype::Document);
        let g = StoreRecord::new("s", Stereotype::Blob);
        assert!(index_with(vec![f, g]).validate().is_ok());
    }

    #[test]
    fn manifest_validation_rejects_bad_fields() {
        let mut escape = StoreRecord::new("../etc", Stereotype::Blob);
        escape.blobs.push(blob("x", "data/0"));
        assert!(index_with(vec![escape]).validate().is_err());

        let mut empty_id = StoreRecord::new("s", Stereotype::Blob);
        empty_id.blobs.push(blob("", "data/0"));
        assert!(index_with(vec![empty_id]).validate().is_err());

        let mut index_path = StoreRecord::new("s", Stereotype::Blob);
        index_path.blobs.push(blob("x", INDEX_NAME));
        assert!(index_with(vec![index_path]).validate().is_err());

        let mut bad_digest = StoreRecord::new("s", Stereotype::Blob);
        let mut record = blob("x", "data/0");
        record.sha256 = "ABC".into();
        bad_digest.blobs.push(record);
        assert!(index_with(vec![bad_digest]).validate().is_err());
    }

    #[test]
    fn data_paths_are_sequential() {
        assert_eq!(data_path(0), "data/0");
        assert_eq!(data_path(41), "data/41");
    }
}
