//! Durable local backend: SQLite metadata plus a flat-file blob store, both rooted in
//! one base directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::info;

use batchforge_core::{
    ExecutionJob, ExecutionJobId, JobTotals, MasterJob, MasterJobId, MasterJobStatus, Project,
    ProjectId, Record, RecordCounts, RecordId, RecordStatus,
};

use crate::blob::BlobStore;
use crate::sqlite::{SqliteMetadataStore, WriteRetry};
use crate::store::{MasterJobFilter, Pagination, RecordFilter, Storage, StorageError};

pub const METADATA_FILE: &str = "metadata.db";

#[derive(Debug)]
pub struct LocalStorage {
    base_dir: PathBuf,
    metadata: SqliteMetadataStore,
    blobs: BlobStore,
}

impl LocalStorage {
    /// Open the store rooted at `base_dir`. Call [`Storage::setup`] before use.
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::open_with_retry(base_dir, WriteRetry::default()).await
    }

    pub async fn open_with_retry(
        base_dir: impl Into<PathBuf>,
        retry: WriteRetry,
    ) -> Result<Self, StorageError> {
        let base_dir = base_dir.into();
        let metadata = SqliteMetadataStore::connect(&base_dir.join(METADATA_FILE), retry).await?;
        let blobs = BlobStore::new(&base_dir);
        Ok(Self {
            base_dir,
            metadata,
            blobs,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn metadata(&self) -> &SqliteMetadataStore {
        &self.metadata
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn setup(&self) -> Result<(), StorageError> {
        self.blobs.setup().await?;
        self.metadata.setup().await?;
        info!(base_dir = %self.base_dir.display(), "local storage ready");
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.metadata.close().await;
        Ok(())
    }

    async fn save_project(&self, project: &Project) -> Result<(), StorageError> {
        self.metadata.save_project(project).await
    }

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>, StorageError> {
        self.metadata.get_project(id).await
    }

    async fn list_projects(&self, pagination: Pagination) -> Result<Vec<Project>, StorageError> {
        self.metadata.list_projects(pagination).await
    }

    async fn log_master_job_start(&self, job: &MasterJob) -> Result<(), StorageError> {
        self.metadata.log_master_job_start(job).await
    }

    async fn log_master_job_end(
        &self,
        id: MasterJobId,
        status: MasterJobStatus,
        totals: &JobTotals,
        end_time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.metadata
            .log_master_job_end(id, status, totals, end_time)
            .await
    }

    async fn update_master_job_status(
        &self,
        id: MasterJobId,
        status: MasterJobStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.metadata.update_master_job_status(id, status, at).await
    }

    async fn get_master_job(&self, id: MasterJobId) -> Result<Option<MasterJob>, StorageError> {
        self.metadata.get_master_job(id).await
    }

    async fn list_master_jobs(
        &self,
        filter: &MasterJobFilter,
    ) -> Result<Vec<MasterJob>, StorageError> {
        self.metadata.list_master_jobs(filter).await
    }

    async fn log_execution_job_start(&self, job: &ExecutionJob) -> Result<(), StorageError> {
        self.metadata.log_execution_job_start(job).await
    }

    async fn log_execution_jobs_start_batch(
        &self,
        jobs: &[ExecutionJob],
    ) -> Result<(), StorageError> {
        self.metadata.log_execution_jobs_start_batch(jobs).await
    }

    async fn log_execution_job_end(
        &self,
        id: ExecutionJobId,
        status: RecordStatus,
        counts: &RecordCounts,
        error_message: Option<&str>,
        end_time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.metadata
            .log_execution_job_end(id, status, counts, error_message, end_time)
            .await
    }

    async fn get_execution_job(
        &self,
        id: ExecutionJobId,
    ) -> Result<Option<ExecutionJob>, StorageError> {
        self.metadata.get_execution_job(id).await
    }

    async fn list_execution_jobs(
        &self,
        master_job_id: MasterJobId,
    ) -> Result<Vec<ExecutionJob>, StorageError> {
        self.metadata.list_execution_jobs(master_job_id).await
    }

    async fn list_execution_jobs_by_hash(
        &self,
        master_job_id: MasterJobId,
        hash: &str,
        status: RecordStatus,
    ) -> Result<Vec<ExecutionJob>, StorageError> {
        self.metadata
            .list_execution_jobs_by_hash(master_job_id, hash, status)
            .await
    }

    async fn log_record_metadata(&self, record: &Record) -> Result<(), StorageError> {
        self.metadata.log_record_metadata(record).await
    }

    async fn log_records_batch(&self, records: &[Record]) -> Result<(), StorageError> {
        self.metadata.log_records_batch(records).await
    }

    async fn get_record_metadata(&self, id: RecordId) -> Result<Option<Record>, StorageError> {
        self.metadata.get_record_metadata(id).await
    }

    async fn list_records(
        &self,
        master_job_id: MasterJobId,
        filter: &RecordFilter,
    ) -> Result<Vec<Record>, StorageError> {
        self.metadata.list_records(master_job_id, filter).await
    }

    async fn list_records_by_execution_job(
        &self,
        job_id: ExecutionJobId,
    ) -> Result<Vec<Record>, StorageError> {
        self.metadata.list_records_by_execution_job(job_id).await
    }

    async fn count_records_by_status(
        &self,
        master_job_id: MasterJobId,
    ) -> Result<HashMap<RecordStatus, u64>, StorageError> {
        self.metadata.count_records_by_status(master_job_id).await
    }

    async fn save_request_config(
        &self,
        master_job_id: MasterJobId,
        config: &JsonValue,
    ) -> Result<String, StorageError> {
        self.blobs.save_request_config(master_job_id, config).await
    }

    async fn get_request_config(
        &self,
        config_ref: &str,
    ) -> Result<Option<JsonValue>, StorageError> {
        self.blobs.read_json(config_ref).await
    }

    async fn save_record_data(
        &self,
        record_id: RecordId,
        payload: &JsonValue,
    ) -> Result<String, StorageError> {
        self.blobs.save_record_data(record_id, payload).await
    }

    async fn get_record_data(&self, output_ref: &str) -> Result<Option<JsonValue>, StorageError> {
        self.blobs.read_json(output_ref).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn survives_reopen() {
        let base = std::env::temp_dir().join(format!("batchforge-local-{}", uuid::Uuid::now_v7().simple()));

        let project = Project::new("reopen");
        let master = MasterJob::new(MasterJobId::new(), project.id, "m", "configs/m.json", 2);
        let payload_ref;
        {
            let store = LocalStorage::open(&base).await.unwrap();
            store.setup().await.unwrap();
            store.save_project(&project).await.unwrap();
            store.log_master_job_start(&master).await.unwrap();

            let job = ExecutionJob::new(master.id, 0, json!({"q": "a"}), "h", "w", 1);
            store.log_execution_job_start(&job).await.unwrap();
            let record = Record::for_job(&job, RecordStatus::Completed);
            payload_ref = store.save_record_data(record.id, &json!({"out": 1})).await.unwrap();
            store
                .log_record_metadata(&record.with_output_ref(payload_ref.clone()))
                .await
                .unwrap();
            store.close().await.unwrap();
        }

        let store = LocalStorage::open(&base).await.unwrap();
        store.setup().await.unwrap();
        assert!(base.join(METADATA_FILE).is_file());
        assert_eq!(store.get_master_job(master.id).await.unwrap().unwrap().target_count, 2);
        assert_eq!(store.get_record_data(&payload_ref).await.unwrap(), Some(json!({"out": 1})));
        let records = store
            .list_records(master.id, &RecordFilter::with_status(RecordStatus::Completed))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        store.close().await.unwrap();

        let _ = tokio::fs::remove_dir_all(&base).await;
    }
}
