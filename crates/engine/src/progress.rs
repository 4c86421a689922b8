//! Periodic progress log line while a run is executing.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use batchforge_core::MasterJobId;

use crate::scheduler::{ProgressSnapshot, RunMonitor};

/// Background ticker; stop it with [`ProgressReporter::finish`].
pub struct ProgressReporter {
    stop: CancellationToken,
    join: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn spawn(monitor: RunMonitor, interval: Duration, master_job_id: Option<MasterJobId>) -> Self {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => log_progress(&monitor.snapshot().await, master_job_id),
                    _ = stopped.cancelled() => break,
                }
            }
        });
        Self { stop, join }
    }

    pub async fn finish(self) {
        self.stop.cancel();
        let _ = self.join.await;
    }
}

fn log_progress(snapshot: &ProgressSnapshot, master_job_id: Option<MasterJobId>) {
    let counters = &snapshot.counters;
    let percent = if snapshot.target_count == 0 {
        100.0
    } else {
        (counters.completed as f64 / snapshot.target_count as f64 * 100.0).min(100.0)
    };
    let master_job_id = master_job_id.map(|id| id.to_string()).unwrap_or_default();
    info!(
        master_job_id = %master_job_id,
        completed = counters.completed,
        target = snapshot.target_count,
        percent = (percent * 10.0).round() / 10.0,
        duplicate = counters.duplicate,
        filtered = counters.filtered,
        failed = counters.failed,
        dead_lettered = counters.dead_lettered,
        queued = snapshot.queued,
        in_flight = snapshot.in_flight,
        "progress"
    );
}
