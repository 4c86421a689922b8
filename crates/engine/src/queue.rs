//! Items moving through the scheduler: queued inputs, output entries, dead letters
//! and the per-run counters.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use batchforge_core::{Args, ExecutionJobId, JobTotals, RecordStatus};

/// One assembled record waiting for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct InputItem {
    /// Position in the assembled record stream.
    pub index: usize,
    /// Argument mapping, index key included.
    pub args: Args,
}

/// Terminal outcome of one invocation. The output queue is append-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputEntry {
    pub index: usize,
    pub status: RecordStatus,
    pub payloads: Vec<JsonValue>,
    pub error: Option<String>,
    pub execution_job_id: Option<ExecutionJobId>,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterEntry {
    pub index: usize,
    pub args: Args,
    /// Failed invocations of this input.
    pub attempts: u32,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Invocation counters of one run.
///
/// A failure that dead-letters its input is counted under `dead_lettered` only, so
/// the classified sum never exceeds `total_attempted`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub completed: u64,
    pub duplicate: u64,
    pub filtered: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub total_attempted: u64,
}

impl RunCounters {
    /// Counters for a resumed run: settled outcomes are recounted from the restored
    /// entries, failures carry over from the persisted totals.
    pub fn resumed(totals: &JobTotals, restored: &[OutputEntry]) -> Self {
        let mut counters = Self {
            failed: totals.failed,
            dead_lettered: totals.dead_lettered,
            ..Default::default()
        };
        for entry in restored {
            match entry.status {
                RecordStatus::Completed => counters.completed += 1,
                RecordStatus::Duplicate => counters.duplicate += 1,
                RecordStatus::Filtered => counters.filtered += 1,
                _ => {}
            }
        }
        counters.total_attempted = totals.total_attempted.max(counters.classified());
        counters
    }

    pub fn totals(&self) -> JobTotals {
        JobTotals {
            completed: self.completed,
            filtered: self.filtered,
            duplicate: self.duplicate,
            failed: self.failed,
            dead_lettered: self.dead_lettered,
            total_attempted: self.total_attempted,
        }
    }

    /// Count one non-failed invocation.
    pub fn record(&mut self, status: RecordStatus) {
        self.total_attempted += 1;
        match status {
            RecordStatus::Completed => self.completed += 1,
            RecordStatus::Duplicate => self.duplicate += 1,
            RecordStatus::Filtered => self.filtered += 1,
            RecordStatus::Failed => self.failed += 1,
            RecordStatus::Pending | RecordStatus::Running | RecordStatus::Cancelled => {}
        }
    }

    pub fn record_dead_letter(&mut self) {
        self.total_attempted += 1;
        self.dead_lettered += 1;
    }

    pub fn classified(&self) -> u64 {
        self.totals().classified()
    }
}
