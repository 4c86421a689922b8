//! Flat-file blob store for request configs and record payloads.
//!
//! Layout under the base directory:
//!
//! - `configs/{master_job_id}.json`
//! - `data/{h0h1}/{h2h3}/{record_id}.json`, where `h` is the SHA-256 hex of the record
//!   id; the two-level prefix bounds directory fan-out.
//!
//! References handed out are paths relative to the base directory. Writes go to a
//! temporary sibling first and are renamed into place, so a crash never leaves a
//! half-written blob under its final name.

use std::path::{Component, Path, PathBuf};

use serde_json::Value as JsonValue;
use uuid::Uuid;

use batchforge_core::{MasterJobId, RecordId, sha256_hex};

use crate::store::StorageError;

/// Reference of the request config of `master_job_id`.
pub fn config_ref(master_job_id: MasterJobId) -> String {
    format!("configs/{master_job_id}.json")
}

/// Reference of the payload of `record_id`.
pub fn record_data_ref(record_id: RecordId) -> String {
    let id = record_id.to_string();
    let hash = sha256_hex(id.as_bytes());
    format!("data/{}/{}/{}.json", &hash[0..2], &hash[2..4], id)
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    base: PathBuf,
}

impl BlobStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Create the top-level directories.
    pub async fn setup(&self) -> Result<(), StorageError> {
        for dir in ["configs", "data"] {
            let path = self.base.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| io_error(&path, e))?;
        }
        Ok(())
    }

    pub async fn save_request_config(
        &self,
        master_job_id: MasterJobId,
        config: &JsonValue,
    ) -> Result<String, StorageError> {
        let reference = config_ref(master_job_id);
        self.write_json(&reference, config).await?;
        Ok(reference)
    }

    pub async fn save_record_data(
        &self,
        record_id: RecordId,
        payload: &JsonValue,
    ) -> Result<String, StorageError> {
        let reference = record_data_ref(record_id);
        self.write_json(&reference, payload).await?;
        Ok(reference)
    }

    pub async fn write_json(&self, reference: &str, value: &JsonValue) -> Result<(), StorageError> {
        let path = self.resolve(reference)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        let bytes = serde_json::to_vec(value)?;
        let tmp = path.with_extension(format!("json.tmp-{}", Uuid::now_v7().simple()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;
        Ok(())
    }

    /// Read a blob; a missing file is `Ok(None)`.
    pub async fn read_json(&self, reference: &str) -> Result<Option<JsonValue>, StorageError> {
        let path = self.resolve(reference)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    /// Map a reference onto the base directory, refusing anything that escapes it.
    fn resolve(&self, reference: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(reference);
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !contained || reference.is_empty() {
            return Err(StorageError::InvalidData(format!(
                "blob reference escapes the store: '{reference}'"
            )));
        }
        Ok(self.base.join(relative))
    }
}

fn io_error(path: &Path, err: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_base() -> PathBuf {
        std::env::temp_dir().join(format!("batchforge-blob-{}", Uuid::now_v7().simple()))
    }

    #[test]
    fn record_refs_are_sharded_by_hash_prefix() {
        let id = RecordId::new();
        let reference = record_data_ref(id);
        let hash = sha256_hex(id.to_string().as_bytes());

        let parts: Vec<&str> = reference.split('/').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "data");
        assert_eq!(parts[1], &hash[0..2]);
        assert_eq!(parts[2], &hash[2..4]);
        assert_eq!(parts[3], format!("{id}.json"));
    }

    #[tokio::test]
    async fn payloads_round_trip_and_missing_blobs_are_none() {
        let base = temp_base();
        let store = BlobStore::new(&base);
        store.setup().await.unwrap();

        let id = RecordId::new();
        let payload = json!({"answer": 42, "tags": ["a"]});
        let reference = store.save_record_data(id, &payload).await.unwrap();
        assert_eq!(store.read_json(&reference).await.unwrap(), Some(payload));

        let missing = record_data_ref(RecordId::new());
        assert_eq!(store.read_json(&missing).await.unwrap(), None);

        let master = MasterJobId::new();
        let config_ref = store.save_request_config(master, &json!({"v": 1})).await.unwrap();
        assert!(base.join(&config_ref).is_file());

        let _ = tokio::fs::remove_dir_all(&base).await;
    }

    #[tokio::test]
    async fn escaping_references_are_rejected() {
        let store = BlobStore::new(temp_base());
        assert!(store.read_json("../etc/passwd").await.is_err());
        assert!(store.read_json("/abs/path.json").await.is_err());
        assert!(store.read_json("").await.is_err());
    }
}
