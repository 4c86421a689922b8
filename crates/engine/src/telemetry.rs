//! End-of-run telemetry sink.

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use batchforge_core::{MasterJobId, MasterJobStatus};

use crate::queue::RunCounters;
use crate::scheduler::StopReason;

/// Summary of one finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub mode: &'static str,
    pub project_name: String,
    pub master_job_id: Option<MasterJobId>,
    pub status: MasterJobStatus,
    /// `None` when the run aborted before scheduling.
    pub stop_reason: Option<StopReason>,
    pub target_count: u64,
    pub counters: RunCounters,
    pub duration_ms: u64,
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record(&self, event: &TelemetryEvent) -> anyhow::Result<()>;
}

/// Logs the event as a structured `info` line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

#[async_trait]
impl TelemetrySink for TracingTelemetry {
    async fn record(&self, event: &TelemetryEvent) -> anyhow::Result<()> {
        let master_job_id = event.master_job_id.map(|id| id.to_string()).unwrap_or_default();
        info!(
            mode = event.mode,
            project = %event.project_name,
            master_job_id = %master_job_id,
            status = %event.status,
            stop_reason = event.stop_reason.map_or("aborted", |r| r.as_str()),
            target = event.target_count,
            completed = event.counters.completed,
            duplicate = event.counters.duplicate,
            filtered = event.counters.filtered,
            failed = event.counters.failed,
            dead_lettered = event.counters.dead_lettered,
            total_attempted = event.counters.total_attempted,
            duration_ms = event.duration_ms,
            "run finished"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

#[async_trait]
impl TelemetrySink for NoopTelemetry {
    async fn record(&self, _event: &TelemetryEvent) -> anyhow::Result<()> {
        Ok(())
    }
}
