//! Storage abstraction shared by every backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use batchforge_core::{
    CoreError, ExecutionJob, ExecutionJobId, JobTotals, MasterJob, MasterJobId, MasterJobStatus,
    Project, ProjectId, Record, RecordCounts, RecordId, RecordStatus,
};

/// Storage operation error.
///
/// These are infrastructure errors (database, filesystem, decoding) as opposed to
/// caller input errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error during {op}: {message}")]
    Database { op: &'static str, message: String },

    #[error("database still busy after {attempts} attempts during {op}")]
    Busy { op: &'static str, attempts: u32 },

    #[error("io error at {path}: {message}")]
    Io { path: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

impl From<CoreError> for StorageError {
    fn from(value: CoreError) -> Self {
        StorageError::InvalidData(value.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(value: serde_json::Error) -> Self {
        StorageError::Serialization(value.to_string())
    }
}

/// Pagination parameters for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of rows to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub const MAX_LIMIT: u32 = 10_000;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }

    /// The largest page a single query may return.
    pub fn all() -> Self {
        Self {
            limit: Self::MAX_LIMIT,
            offset: 0,
        }
    }
}

/// Filter for listing master jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterJobFilter {
    pub project_id: Option<ProjectId>,
    pub status: Option<MasterJobStatus>,
    pub pagination: Pagination,
}

/// Filter for listing records of a master job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    pub status: Option<RecordStatus>,
    pub pagination: Pagination,
}

impl RecordFilter {
    pub fn with_status(status: RecordStatus) -> Self {
        Self {
            status: Some(status),
            pagination: Pagination::all(),
        }
    }
}

/// Persistence boundary for projects, jobs, records and their payload blobs.
///
/// Every method may be called concurrently from many scheduler workers. Durable
/// implementations must serialize their own writes; callers do no locking.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Prepare the backend (create tables, directories).
    async fn setup(&self) -> Result<(), StorageError>;

    /// Release connections. Further calls are not expected after this.
    async fn close(&self) -> Result<(), StorageError>;

    async fn save_project(&self, project: &Project) -> Result<(), StorageError>;

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>, StorageError>;

    async fn list_projects(&self, pagination: Pagination) -> Result<Vec<Project>, StorageError>;

    /// Insert the master job (or mark an existing one as started again on resume).
    async fn log_master_job_start(&self, job: &MasterJob) -> Result<(), StorageError>;

    async fn log_master_job_end(
        &self,
        id: MasterJobId,
        status: MasterJobStatus,
        totals: &JobTotals,
        end_time: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn update_master_job_status(
        &self,
        id: MasterJobId,
        status: MasterJobStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn get_master_job(&self, id: MasterJobId) -> Result<Option<MasterJob>, StorageError>;

    async fn list_master_jobs(
        &self,
        filter: &MasterJobFilter,
    ) -> Result<Vec<MasterJob>, StorageError>;

    async fn log_execution_job_start(&self, job: &ExecutionJob) -> Result<(), StorageError>;

    async fn log_execution_jobs_start_batch(
        &self,
        jobs: &[ExecutionJob],
    ) -> Result<(), StorageError>;

    async fn log_execution_job_end(
        &self,
        id: ExecutionJobId,
        status: RecordStatus,
        counts: &RecordCounts,
        error_message: Option<&str>,
        end_time: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn get_execution_job(
        &self,
        id: ExecutionJobId,
    ) -> Result<Option<ExecutionJob>, StorageError>;

    async fn list_execution_jobs(
        &self,
        master_job_id: MasterJobId,
    ) -> Result<Vec<ExecutionJob>, StorageError>;

    /// Resume lookup: execution jobs of `master_job_id` with `run_config_hash == hash`
    /// and the given status.
    async fn list_execution_jobs_by_hash(
        &self,
        master_job_id: MasterJobId,
        hash: &str,
        status: RecordStatus,
    ) -> Result<Vec<ExecutionJob>, StorageError>;

    async fn log_record_metadata(&self, record: &Record) -> Result<(), StorageError>;

    async fn log_records_batch(&self, records: &[Record]) -> Result<(), StorageError>;

    async fn get_record_metadata(&self, id: RecordId) -> Result<Option<Record>, StorageError>;

    async fn list_records(
        &self,
        master_job_id: MasterJobId,
        filter: &RecordFilter,
    ) -> Result<Vec<Record>, StorageError>;

    async fn list_records_by_execution_job(
        &self,
        job_id: ExecutionJobId,
    ) -> Result<Vec<Record>, StorageError>;

    async fn count_records_by_status(
        &self,
        master_job_id: MasterJobId,
    ) -> Result<HashMap<RecordStatus, u64>, StorageError>;

    /// Store the request configuration; returns its reference.
    async fn save_request_config(
        &self,
        master_job_id: MasterJobId,
        config: &JsonValue,
    ) -> Result<String, StorageError>;

    async fn get_request_config(&self, config_ref: &str)
    -> Result<Option<JsonValue>, StorageError>;

    /// Store one record payload; returns its reference.
    async fn save_record_data(
        &self,
        record_id: RecordId,
        payload: &JsonValue,
    ) -> Result<String, StorageError>;

    async fn get_record_data(&self, output_ref: &str) -> Result<Option<JsonValue>, StorageError>;
}
