//! Storage backend selection.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::local::LocalStorage;
use crate::noop::NoopStorage;
use crate::store::{Storage, StorageError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Persist nothing. Runs cannot be resumed.
    #[default]
    Noop,
    /// SQLite metadata and file blobs under `base_dir`.
    Local { base_dir: PathBuf },
}

impl StorageConfig {
    pub fn local(base_dir: impl Into<PathBuf>) -> Self {
        StorageConfig::Local {
            base_dir: base_dir.into(),
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self, StorageConfig::Local { .. })
    }
}

/// Build the configured backend and run its setup.
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    let storage: Arc<dyn Storage> = match config {
        StorageConfig::Noop => Arc::new(NoopStorage::new()),
        StorageConfig::Local { base_dir } => Arc::new(LocalStorage::open(base_dir.clone()).await?),
    };
    storage.setup().await?;
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_is_tagged_by_kind() {
        let config = StorageConfig::local("/tmp/forge");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "local", "base_dir": "/tmp/forge"}));

        let noop: StorageConfig = serde_json::from_value(serde_json::json!({"kind": "noop"})).unwrap();
        assert_eq!(noop, StorageConfig::Noop);
        assert!(!noop.is_durable());
    }

    #[tokio::test]
    async fn opens_noop_backend() {
        let storage = open(&StorageConfig::Noop).await.unwrap();
        assert!(storage.list_projects(Default::default()).await.unwrap().is_empty());
    }
}
