//! Storage backend that keeps nothing.
//!
//! Used for ephemeral runs that never need resume: every write succeeds and is
//! dropped, every read comes back empty.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use batchforge_core::{
    ExecutionJob, ExecutionJobId, JobTotals, MasterJob, MasterJobId, MasterJobStatus, Project,
    ProjectId, Record, RecordCounts, RecordId, RecordStatus,
};

use crate::blob::{config_ref, record_data_ref};
use crate::store::{MasterJobFilter, Pagination, RecordFilter, Storage, StorageError};

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStorage;

impl NoopStorage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Storage for NoopStorage {
    async fn setup(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn save_project(&self, _project: &Project) -> Result<(), StorageError> {
        Ok(())
    }

    async fn get_project(&self, _id: ProjectId) -> Result<Option<Project>, StorageError> {
        Ok(None)
    }

    async fn list_projects(&self, _pagination: Pagination) -> Result<Vec<Project>, StorageError> {
        Ok(Vec::new())
    }

    async fn log_master_job_start(&self, _job: &MasterJob) -> Result<(), StorageError> {
        Ok(())
    }

    async fn log_master_job_end(
        &self,
        _id: MasterJobId,
        _status: MasterJobStatus,
        _totals: &JobTotals,
        _end_time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        Ok(())
    }

    async fn update_master_job_status(
        &self,
        _id: MasterJobId,
        _status: MasterJobStatus,
        _at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        Ok(())
    }

    async fn get_master_job(&self, _id: MasterJobId) -> Result<Option<MasterJob>, StorageError> {
        Ok(None)
    }

    async fn list_master_jobs(
        &self,
        _filter: &MasterJobFilter,
    ) -> Result<Vec<MasterJob>, StorageError> {
        Ok(Vec::new())
    }

    async fn log_execution_job_start(&self, _job: &ExecutionJob) -> Result<(), StorageError> {
        Ok(())
    }

    async fn log_execution_jobs_start_batch(
        &self,
        _jobs: &[ExecutionJob],
    ) -> Result<(), StorageError> {
        Ok(())
    }

    async fn log_execution_job_end(
        &self,
        _id: ExecutionJobId,
        _status: RecordStatus,
        _counts: &RecordCounts,
        _error_message: Option<&str>,
        _end_time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        Ok(())
    }

    async fn get_execution_job(
        &self,
        _id: ExecutionJobId,
    ) -> Result<Option<ExecutionJob>, StorageError> {
        Ok(None)
    }

    async fn list_execution_jobs(
        &self,
        _master_job_id: MasterJobId,
    ) -> Result<Vec<ExecutionJob>, StorageError> {
        Ok(Vec::new())
    }

    async fn list_execution_jobs_by_hash(
        &self,
        _master_job_id: MasterJobId,
        _hash: &str,
        _status: RecordStatus,
    ) -> Result<Vec<ExecutionJob>, StorageError> {
        Ok(Vec::new())
    }

    async fn log_record_metadata(&self, _record: &Record) -> Result<(), StorageError> {
        Ok(())
    }

    async fn log_records_batch(&self, _records: &[Record]) -> Result<(), StorageError> {
        Ok(())
    }

    async fn get_record_metadata(&self, _id: RecordId) -> Result<Option<Record>, StorageError> {
        Ok(None)
    }

    async fn list_records(
        &self,
        _master_job_id: MasterJobId,
        _filter: &RecordFilter,
    ) -> Result<Vec<Record>, StorageError> {
        Ok(Vec::new())
    }

    async fn list_records_by_execution_job(
        &self,
        _job_id: ExecutionJobId,
    ) -> Result<Vec<Record>, StorageError> {
        Ok(Vec::new())
    }

    async fn count_records_by_status(
        &self,
        _master_job_id: MasterJobId,
    ) -> Result<HashMap<RecordStatus, u64>, StorageError> {
        Ok(HashMap::new())
    }

    async fn save_request_config(
        &self,
        master_job_id: MasterJobId,
        _config: &JsonValue,
    ) -> Result<String, StorageError> {
        Ok(config_ref(master_job_id))
    }

    async fn get_request_config(
        &self,
        _config_ref: &str,
    ) -> Result<Option<JsonValue>, StorageError> {
        Ok(None)
    }

    async fn save_record_data(
        &self,
        record_id: RecordId,
        _payload: &JsonValue,
    ) -> Result<String, StorageError> {
        Ok(record_data_ref(record_id))
    }

    async fn get_record_data(&self, _output_ref: &str) -> Result<Option<JsonValue>, StorageError> {
        Ok(None)
    }
}
