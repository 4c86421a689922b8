//! Persistent data model: projects, master jobs, execution jobs and records.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::CoreError;
use crate::id::{ExecutionJobId, MasterJobId, ProjectId, RecordId};

macro_rules! impl_status_strings {
    ($t:ty, $name:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $t {
            /// Stable snake_case name, as persisted.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(CoreError::invalid_status(format!("{}: '{}'", $name, other))),
                }
            }
        }
    };
}

/// Lifecycle of a master job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    CompletedWithErrors,
    Cancelled,
}

impl_status_strings!(MasterJobStatus, "MasterJobStatus", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    CompletedWithErrors => "completed_with_errors",
    Cancelled => "cancelled",
});

impl MasterJobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MasterJobStatus::Pending | MasterJobStatus::Running)
    }
}

/// Outcome of one invocation (execution job) and of each record it produced.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Running,
    Completed,
    Duplicate,
    Filtered,
    Failed,
    Cancelled,
}

impl_status_strings!(RecordStatus, "RecordStatus", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Duplicate => "duplicate",
    Filtered => "filtered",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl RecordStatus {
    /// Statuses an invocation can end in once it has run.
    pub const TERMINAL: [RecordStatus; 4] = [
        RecordStatus::Completed,
        RecordStatus::Duplicate,
        RecordStatus::Filtered,
        RecordStatus::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

/// A named group of master jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ProjectId::new(),
            name: name.into(),
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Per-status invocation totals of a master job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTotals {
    pub completed: u64,
    pub filtered: u64,
    pub duplicate: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub total_attempted: u64,
}

impl JobTotals {
    /// Sum of every terminal classification (must never exceed `total_attempted`).
    pub fn classified(&self) -> u64 {
        self.completed + self.filtered + self.duplicate + self.failed + self.dead_lettered
    }
}

/// One logical end-to-end run over an input set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterJob {
    pub id: MasterJobId,
    pub project_id: ProjectId,
    pub name: String,
    pub status: MasterJobStatus,
    /// Blob reference of the serialized request configuration.
    pub request_config_ref: String,
    /// Fixed once resolved; never changes across resumes.
    pub target_count: u64,
    pub totals: JobTotals,
    pub creation_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub update_time: DateTime<Utc>,
}

impl MasterJob {
    pub fn new(
        id: MasterJobId,
        project_id: ProjectId,
        name: impl Into<String>,
        request_config_ref: impl Into<String>,
        target_count: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            project_id,
            name: name.into(),
            status: MasterJobStatus::Pending,
            request_config_ref: request_config_ref.into(),
            target_count,
            totals: JobTotals::default(),
            creation_time: now,
            start_time: None,
            end_time: None,
            update_time: now,
        }
    }

    pub fn mark_running(&mut self) {
        let now = Utc::now();
        self.status = MasterJobStatus::Running;
        self.start_time.get_or_insert(now);
        self.update_time = now;
    }

    pub fn mark_finished(&mut self, status: MasterJobStatus, totals: JobTotals) {
        let now = Utc::now();
        self.status = status;
        self.totals = totals;
        self.end_time = Some(now);
        self.update_time = now;
    }
}

/// Per-status record sub-counts of one execution job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    pub completed: u64,
    pub filtered: u64,
    pub duplicate: u64,
    pub failed: u64,
}

impl RecordCounts {
    /// Counts for `records` records that all share one status.
    pub fn uniform(status: RecordStatus, records: u64) -> Self {
        let mut counts = Self::default();
        match status {
            RecordStatus::Completed => counts.completed = records,
            RecordStatus::Filtered => counts.filtered = records,
            RecordStatus::Duplicate => counts.duplicate = records,
            RecordStatus::Failed => counts.failed = records,
            RecordStatus::Pending | RecordStatus::Running | RecordStatus::Cancelled => {}
        }
        counts
    }

    pub fn total(&self) -> u64 {
        self.completed + self.filtered + self.duplicate + self.failed
    }
}

/// One dispatched unit-of-work invocation for one input record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionJob {
    pub id: ExecutionJobId,
    pub master_job_id: MasterJobId,
    pub status: RecordStatus,
    /// Argument mapping the unit of work was called with (index key stripped).
    pub run_config: JsonValue,
    /// Content hash of `run_config`; the resume idempotency key.
    pub run_config_hash: String,
    /// Position of the input in the assembled record stream.
    pub input_index: u64,
    pub worker_id: String,
    /// 1-based attempt of this input within the run.
    pub attempt: u32,
    pub counts: RecordCounts,
    pub error_message: Option<String>,
    pub creation_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub update_time: DateTime<Utc>,
}

impl ExecutionJob {
    pub fn new(
        master_job_id: MasterJobId,
        input_index: u64,
        run_config: JsonValue,
        run_config_hash: impl Into<String>,
        worker_id: impl Into<String>,
        attempt: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ExecutionJobId::new(),
            master_job_id,
            status: RecordStatus::Running,
            run_config,
            run_config_hash: run_config_hash.into(),
            input_index,
            worker_id: worker_id.into(),
            attempt,
            counts: RecordCounts::default(),
            error_message: None,
            creation_time: now,
            start_time: Some(now),
            end_time: None,
            update_time: now,
        }
    }

    pub fn mark_finished(
        &mut self,
        status: RecordStatus,
        counts: RecordCounts,
        error_message: Option<String>,
    ) {
        let now = Utc::now();
        self.status = status;
        self.counts = counts;
        self.error_message = error_message;
        self.end_time = Some(now);
        self.update_time = now;
    }
}

/// One output payload produced by an execution job. The payload itself lives in the
/// blob store under `output_ref`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub job_id: ExecutionJobId,
    /// Denormalized copy of the execution job's master job id.
    pub master_job_id: MasterJobId,
    pub status: RecordStatus,
    pub output_ref: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Create a record owned by `job`; the master job id is copied from it.
    pub fn for_job(job: &ExecutionJob, status: RecordStatus) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new(),
            job_id: job.id,
            master_job_id: job.master_job_id,
            status,
            output_ref: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_output_ref(mut self, output_ref: impl Into<String>) -> Self {
        self.output_ref = Some(output_ref.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_round_trip_through_strings() {
        for status in [
            MasterJobStatus::Pending,
            MasterJobStatus::Running,
            MasterJobStatus::Completed,
            MasterJobStatus::Failed,
            MasterJobStatus::CompletedWithErrors,
            MasterJobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<MasterJobStatus>().unwrap(), status);
        }

        assert_eq!("duplicate".parse::<RecordStatus>().unwrap(), RecordStatus::Duplicate);
        assert!("done".parse::<RecordStatus>().is_err());
    }

    #[test]
    fn serde_names_match_persisted_names() {
        let json = serde_json::to_string(&MasterJobStatus::CompletedWithErrors).unwrap();
        assert_eq!(json, "\"completed_with_errors\"");
    }

    #[test]
    fn record_inherits_master_job_of_its_execution_job() {
        let master = MasterJobId::new();
        let job = ExecutionJob::new(master, 3, serde_json::json!({"x": 1}), "abc", "w-1", 1);
        let record = Record::for_job(&job, RecordStatus::Completed).with_output_ref("data/ab/cd/x.json");

        assert_eq!(record.master_job_id, master);
        assert_eq!(record.job_id, job.id);
        assert_eq!(record.output_ref.as_deref(), Some("data/ab/cd/x.json"));
    }

    #[test]
    fn master_job_keeps_first_start_time() {
        let mut job = MasterJob::new(MasterJobId::new(), ProjectId::new(), "job", "configs/x.json", 5);
        job.mark_running();
        let first = job.start_time;
        job.mark_running();
        assert_eq!(job.start_time, first);

        let totals = JobTotals {
            completed: 5,
            total_attempted: 5,
            ..Default::default()
        };
        job.mark_finished(MasterJobStatus::Completed, totals);
        assert!(job.status.is_terminal());
        assert_eq!(job.target_count, 5);
        assert_eq!(job.totals.classified(), 5);
    }

    #[test]
    fn uniform_counts_only_touch_one_bucket() {
        let counts = RecordCounts::uniform(RecordStatus::Filtered, 4);
        assert_eq!(counts.filtered, 4);
        assert_eq!(counts.total(), 4);
        assert_eq!(RecordCounts::uniform(RecordStatus::Cancelled, 2).total(), 0);
    }
}
