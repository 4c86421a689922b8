//! `DataFactory`: run-mode selection, job identity and result access.
//!
//! Every call builds a fresh [`RunContext`] from the factory's config (or, on resume,
//! the persisted request config) and hands it to the scheduler. Nothing in the
//! factory's own config is mutated by a run.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use batchforge_core::{
    Args, ExecutionJob, ExecutionJobId, Inputs, MasterJob, MasterJobId, MasterJobStatus, Project, RecordStatus,
    assemble, content_hash, record_index,
};
use batchforge_storage::{Pagination, Storage};

use crate::config::{FactoryConfig, RequestConfig, ResumeOptions};
use crate::error::{FactoryError, FactoryResult};
use crate::progress::ProgressReporter;
use crate::queue::{InputItem, OutputEntry, RunCounters};
use crate::registry::{Registry, Resolved, WorkSpec};
use crate::results::RunResults;
use crate::scheduler::{Persistence, Scheduler, SchedulerConfig, Seed, StopReason};
use crate::state::SharedState;
use crate::telemetry::{TelemetryEvent, TelemetrySink, TracingTelemetry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Normal,
    /// First record only, nothing persisted.
    DryRun,
    Resume { master_job_id: MasterJobId },
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Normal => "normal",
            RunMode::DryRun => "dry_run",
            RunMode::Resume { .. } => "resume",
        }
    }
}

/// Everything one run needs, resolved up front.
struct RunContext {
    mode: RunMode,
    config: FactoryConfig,
    resolved: Resolved,
    /// `None` for dry runs.
    durable: Option<Durable>,
    state: SharedState,
    target_count: u64,
    seed: Seed,
}

struct Durable {
    storage: Arc<dyn Storage>,
    master: MasterJob,
    request: RequestConfig,
}

#[derive(Debug)]
struct LastRun {
    mode: RunMode,
    results: RunResults,
    counters: RunCounters,
    state: SharedState,
    status: MasterJobStatus,
    stop_reason: StopReason,
}

/// Batch orchestrator façade.
pub struct DataFactory {
    config: FactoryConfig,
    registry: Registry,
    storage: Arc<dyn Storage>,
    telemetry: Arc<dyn TelemetrySink>,
    last: Option<LastRun>,
    last_master_job_id: Option<MasterJobId>,
}

impl DataFactory {
    /// Open the configured storage backend and build a factory.
    pub async fn new(config: FactoryConfig, registry: Registry) -> FactoryResult<Self> {
        config.validate()?;
        let storage = batchforge_storage::open(&config.storage).await?;
        Ok(Self::assemble_parts(config, registry, storage))
    }

    /// Build a factory over an existing backend (set up here).
    pub async fn with_storage(
        config: FactoryConfig,
        registry: Registry,
        storage: Arc<dyn Storage>,
    ) -> FactoryResult<Self> {
        config.validate()?;
        storage.setup().await?;
        Ok(Self::assemble_parts(config, registry, storage))
    }

    fn assemble_parts(config: FactoryConfig, registry: Registry, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            registry,
            storage,
            telemetry: Arc::new(TracingTelemetry),
            last: None,
            last_master_job_id: None,
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    /// Assemble `inputs`, persist a new master job and run every record.
    ///
    /// Returns the completed payloads. Fails with [`FactoryError::Output`] when no
    /// record completed; the per-status accessors stay usable either way.
    pub async fn run(&mut self, inputs: Inputs) -> FactoryResult<Vec<JsonValue>> {
        self.last = None;
        let ctx = match self.prepare_normal(&inputs).await {
            Ok(ctx) => ctx,
            Err(e) => return Err(self.abort(RunMode::Normal, e).await),
        };
        self.execute(ctx).await
    }

    /// Run the first assembled record only, persisting nothing.
    pub async fn dry_run(&mut self, inputs: Inputs) -> FactoryResult<Vec<JsonValue>> {
        self.last = None;
        let ctx = self.prepare_dry_run(&inputs)?;
        self.execute(ctx).await
    }

    /// Continue `master_job_id`, skipping records that already settled as completed,
    /// duplicate or filtered.
    pub async fn resume(
        &mut self,
        master_job_id: MasterJobId,
        options: ResumeOptions,
    ) -> FactoryResult<Vec<JsonValue>> {
        self.last = None;
        let mode = RunMode::Resume { master_job_id };
        let ctx = match self.prepare_resume(master_job_id, &options).await {
            Ok(ctx) => ctx,
            Err(e) => return Err(self.abort(mode, e).await),
        };
        self.execute(ctx).await
    }

    async fn prepare_normal(&self, inputs: &Inputs) -> FactoryResult<RunContext> {
        let config = self.config.clone();
        let resolved = self
            .registry
            .resolve(&config.work, &config.on_record_complete, &config.on_record_error)
            .map_err(FactoryError::Configuration)?;
        let records = assemble_records(inputs, &resolved.work)?;
        let target_count = match config.target_count {
            0 => records.len() as u64,
            n => n,
        };
        let state = SharedState::new(config.initial_state.clone());

        let project = self.ensure_project(&config).await?;
        let master_job_id = MasterJobId::new();
        let request = RequestConfig::new(&config, target_count, records.clone(), state.snapshot());
        let config_ref = self
            .storage
            .save_request_config(master_job_id, &request.to_json()?)
            .await?;

        let mut master = MasterJob::new(
            master_job_id,
            project.id,
            config.work.clone(),
            config_ref,
            target_count,
        );
        master.mark_running();
        self.storage.log_master_job_start(&master).await?;
        info!(
            master_job_id = %master_job_id,
            project = %project.name,
            records = records.len(),
            target_count,
            "master job started"
        );

        Ok(RunContext {
            mode: RunMode::Normal,
            seed: Seed {
                inputs: cycle(&records, target_count),
                ..Default::default()
            },
            durable: Some(Durable {
                storage: self.storage.clone(),
                master,
                request,
            }),
            config,
            resolved,
            state,
            target_count,
        })
    }

    fn prepare_dry_run(&self, inputs: &Inputs) -> FactoryResult<RunContext> {
        let config = self.config.clone();
        let resolved = self
            .registry
            .resolve(&config.work, &config.on_record_complete, &config.on_record_error)
            .map_err(FactoryError::Configuration)?;
        let mut records = assemble_records(inputs, &resolved.work)?;
        records.truncate(1);
        debug!(work = %config.work, "dry run on the first record");

        Ok(RunContext {
            mode: RunMode::DryRun,
            seed: Seed {
                inputs: cycle(&records, 1),
                ..Default::default()
            },
            durable: None,
            state: SharedState::new(config.initial_state.clone()),
            config,
            resolved,
            target_count: 1,
        })
    }

    async fn prepare_resume(
        &self,
        master_job_id: MasterJobId,
        options: &ResumeOptions,
    ) -> FactoryResult<RunContext> {
        let mut master = self
            .storage
            .get_master_job(master_job_id)
            .await?
            .ok_or(FactoryError::NotFound(master_job_id))?;
        let raw = self
            .storage
            .get_request_config(&master.request_config_ref)
            .await?
            .ok_or_else(|| {
                FactoryError::NotResumable(format!(
                    "request config '{}' is missing",
                    master.request_config_ref
                ))
            })?;
        let request = RequestConfig::from_json(raw)?;

        let mut config = request.config.clone();
        config.storage = self.config.storage.clone();
        options.apply(&mut config);
        config.validate()?;

        let resolved = self
            .registry
            .resolve(&config.work, &config.on_record_complete, &config.on_record_error)
            .map_err(FactoryError::NotResumable)?;

        let state = SharedState::new(if request.state.is_empty() {
            config.initial_state.clone()
        } else {
            request.state.clone()
        });

        let target_count = master.target_count;
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut restored = Vec::new();
        let mut settled = self.settled_by_index(master_job_id).await?;
        let mut credited = HashSet::new();
        let mut unmatched = Vec::new();
        for item in cycle(&request.inputs, target_count) {
            let hash = content_hash(&item.args);
            match settled
                .get_mut(&(item.index as u64))
                .and_then(|jobs| take_matching(jobs, &hash))
            {
                Some(job) => restored.push((item, job)),
                None => unmatched.push((item, hash)),
            }
        }
        for (_, job) in &restored {
            credited.insert(job.id);
        }
        for (item, hash) in unmatched {
            match self.settled_by_hash(master_job_id, &hash, &credited).await? {
                Some(job) => {
                    credited.insert(job.id);
                    restored.push((item, job));
                }
                None => inputs.push(item),
            }
        }
        restored.sort_by_key(|(item, _)| item.index);
        for (item, job) in restored {
            let payloads = self.load_payloads(&job).await?;
            outputs.push(OutputEntry {
                index: item.index,
                status: job.status,
                payloads,
                error: None,
                execution_job_id: Some(job.id),
                attempt: job.attempt,
            });
        }

        let counters = RunCounters::resumed(&master.totals, &outputs);

        master.mark_running();
        self.storage.log_master_job_start(&master).await?;
        info!(
            master_job_id = %master_job_id,
            reused = outputs.len(),
            pending = inputs.len(),
            target_count,
            "master job resumed"
        );

        Ok(RunContext {
            mode: RunMode::Resume { master_job_id },
            seed: Seed {
                inputs,
                outputs,
                counters,
            },
            durable: Some(Durable {
                storage: self.storage.clone(),
                master,
                request,
            }),
            config,
            resolved,
            state,
            target_count,
        })
    }

    /// Settled (completed, duplicate or filtered) execution jobs keyed by input index,
    /// oldest first.
    async fn settled_by_index(
        &self,
        master_job_id: MasterJobId,
    ) -> FactoryResult<HashMap<u64, VecDeque<ExecutionJob>>> {
        let mut settled: HashMap<u64, VecDeque<ExecutionJob>> = HashMap::new();
        for job in self.storage.list_execution_jobs(master_job_id).await? {
            if is_settled(job.status) {
                settled.entry(job.input_index).or_default().push_back(job);
            }
        }
        Ok(settled)
    }

    /// Fallback for jobs recorded under another index: the oldest settled job with
    /// matching content that has not been credited to an input yet.
    async fn settled_by_hash(
        &self,
        master_job_id: MasterJobId,
        hash: &str,
        credited: &HashSet<ExecutionJobId>,
    ) -> FactoryResult<Option<ExecutionJob>> {
        for status in [RecordStatus::Completed, RecordStatus::Duplicate, RecordStatus::Filtered] {
            let found = self
                .storage
                .list_execution_jobs_by_hash(master_job_id, hash, status)
                .await?
                .into_iter()
                .find(|job| !credited.contains(&job.id));
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    async fn load_payloads(&self, job: &ExecutionJob) -> FactoryResult<Vec<JsonValue>> {
        let mut payloads = Vec::new();
        for record in self.storage.list_records_by_execution_job(job.id).await? {
            let Some(output_ref) = record.output_ref.as_deref() else {
                continue;
            };
            match self.storage.get_record_data(output_ref).await? {
                Some(payload) => payloads.push(payload),
                None => warn!(record_id = %record.id, output_ref, "stored payload is missing"),
            }
        }
        Ok(payloads)
    }

    async fn ensure_project(&self, config: &FactoryConfig) -> FactoryResult<Project> {
        let existing = self
            .storage
            .list_projects(Pagination::all())
            .await?
            .into_iter()
            .find(|p| p.name == config.project_name);
        if let Some(project) = existing {
            return Ok(project);
        }
        let project = Project::new(config.project_name.clone());
        self.storage.save_project(&project).await?;
        Ok(project)
    }

    async fn execute(&mut self, ctx: RunContext) -> FactoryResult<Vec<JsonValue>> {
        let started = Instant::now();
        let RunContext {
            mode,
            config,
            resolved,
            durable,
            state,
            target_count,
            seed,
        } = ctx;
        let master_job_id = durable.as_ref().map(|d| d.master.id);
        if master_job_id.is_some() {
            self.last_master_job_id = master_job_id;
        }

        let persistence = durable.as_ref().map(|d| Persistence {
            storage: d.storage.clone(),
            master_job_id: d.master.id,
        });
        let interrupt = CancellationToken::new();
        let scheduler = Scheduler::new(
            SchedulerConfig::from_factory(&config, target_count),
            &resolved,
            state.clone(),
            persistence,
            seed,
        )
        .with_interrupt(interrupt.clone());

        let progress = config
            .show_progress
            .then(|| ProgressReporter::spawn(scheduler.monitor(), config.progress_interval, master_job_id));
        let listener = config
            .handle_interrupts
            .then(|| listen_for_interrupt(interrupt));

        let report = scheduler.run().await;

        if let Some(progress) = progress {
            progress.finish().await;
        }
        if let Some(listener) = listener {
            listener.abort();
        }

        let results = RunResults::new(report.output, report.dead_letters);
        let interrupted = report.stop_reason == StopReason::Interrupted;
        let status = final_status(interrupted, &results);
        let counters = report.counters;

        let mut fatal = None;
        if let Some(durable) = durable {
            if let Err(e) = finalize(durable, &state, status, &counters).await {
                error!(master_job_id = ?master_job_id, error = %e, "failed to finalize master job");
                fatal = Some(e);
            }
        }

        let event = TelemetryEvent {
            mode: mode.as_str(),
            project_name: config.project_name.clone(),
            master_job_id,
            status,
            stop_reason: Some(report.stop_reason),
            target_count,
            counters,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        self.emit(&event).await;

        let completed = results.output(RecordStatus::Completed).to_vec();
        self.last = Some(LastRun {
            mode,
            results,
            counters,
            state,
            status,
            stop_reason: report.stop_reason,
        });

        if interrupted {
            self.close_quietly().await;
            return Err(FactoryError::Interrupted);
        }
        if let Some(e) = fatal {
            self.close_quietly().await;
            return Err(e);
        }
        if completed.is_empty() {
            return Err(FactoryError::Output(format!(
                "{} failed, {} dead-lettered out of {} attempted",
                counters.failed, counters.dead_lettered, counters.total_attempted
            )));
        }
        Ok(completed)
    }

    /// Fatal error before any work ran. Storage faults close the backend.
    async fn abort(&self, mode: RunMode, error: FactoryError) -> FactoryError {
        if matches!(error, FactoryError::Storage(_)) {
            error!(mode = mode.as_str(), error = %error, "run aborted");
            let event = TelemetryEvent {
                mode: mode.as_str(),
                project_name: self.config.project_name.clone(),
                master_job_id: match mode {
                    RunMode::Resume { master_job_id } => Some(master_job_id),
                    _ => None,
                },
                status: MasterJobStatus::Failed,
                stop_reason: None,
                target_count: 0,
                counters: RunCounters::default(),
                duration_ms: 0,
            };
            self.emit(&event).await;
            self.close_quietly().await;
        }
        error
    }

    async fn emit(&self, event: &TelemetryEvent) {
        if let Err(e) = self.telemetry.record(event).await {
            debug!(error = %e, "telemetry sink rejected event");
        }
    }

    async fn close_quietly(&self) {
        if let Err(e) = self.storage.close().await {
            warn!(error = %e, "failed to close storage");
        }
    }

    /// Release the storage backend.
    pub async fn close(&self) -> FactoryResult<()> {
        self.storage.close().await?;
        Ok(())
    }

    /// Payloads of the last run with `status`.
    pub fn output(&self, status: RecordStatus) -> &[JsonValue] {
        self.last
            .as_ref()
            .map(|last| last.results.output(status))
            .unwrap_or(&[])
    }

    /// Input indices aligned with [`DataFactory::output`].
    pub fn index(&self, status: RecordStatus) -> &[usize] {
        self.last
            .as_ref()
            .map(|last| last.results.index(status))
            .unwrap_or(&[])
    }

    pub fn output_completed(&self) -> &[JsonValue] {
        self.output(RecordStatus::Completed)
    }

    pub fn index_completed(&self) -> &[usize] {
        self.index(RecordStatus::Completed)
    }

    pub fn output_duplicate(&self) -> &[JsonValue] {
        self.output(RecordStatus::Duplicate)
    }

    pub fn index_duplicate(&self) -> &[usize] {
        self.index(RecordStatus::Duplicate)
    }

    pub fn output_filtered(&self) -> &[JsonValue] {
        self.output(RecordStatus::Filtered)
    }

    pub fn index_filtered(&self) -> &[usize] {
        self.index(RecordStatus::Filtered)
    }

    pub fn output_failed(&self) -> &[JsonValue] {
        self.output(RecordStatus::Failed)
    }

    pub fn index_failed(&self) -> &[usize] {
        self.index(RecordStatus::Failed)
    }

    pub fn dead_letter_input(&self) -> Vec<Args> {
        self.last
            .as_ref()
            .map(|last| last.results.dead_letter_input())
            .unwrap_or_default()
    }

    pub fn dead_letter_index(&self) -> Vec<usize> {
        self.last
            .as_ref()
            .map(|last| last.results.dead_letter_index())
            .unwrap_or_default()
    }

    /// Identity of the last normal or resumed run; dry runs leave it unchanged.
    pub fn master_job_id(&self) -> Option<MasterJobId> {
        self.last_master_job_id
    }

    pub fn counters(&self) -> Option<RunCounters> {
        self.last.as_ref().map(|last| last.counters)
    }

    pub fn state(&self) -> Option<SharedState> {
        self.last.as_ref().map(|last| last.state.clone())
    }

    pub fn last_status(&self) -> Option<MasterJobStatus> {
        self.last.as_ref().map(|last| last.status)
    }

    pub fn last_mode(&self) -> Option<RunMode> {
        self.last.as_ref().map(|last| last.mode)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.last.as_ref().map(|last| last.stop_reason)
    }

    pub fn results(&self) -> Option<&RunResults> {
        self.last.as_ref().map(|last| &last.results)
    }
}

fn assemble_records(inputs: &Inputs, work: &WorkSpec) -> FactoryResult<Vec<Args>> {
    let records = assemble(inputs)?;
    if records.is_empty() {
        return Err(FactoryError::Input("no input records".to_string()));
    }
    for record in &records {
        work.check_args(record).map_err(FactoryError::Input)?;
    }
    Ok(records)
}

/// Queue `max(len, target_count)` items, cycling through `records`.
fn cycle(records: &[Args], target_count: u64) -> Vec<InputItem> {
    if records.is_empty() {
        return Vec::new();
    }
    let count = (records.len() as u64).max(target_count) as usize;
    (0..count)
        .map(|k| {
            let position = k % records.len();
            let args = records[position].clone();
            InputItem {
                index: record_index(&args).unwrap_or(position),
                args,
            }
        })
        .collect()
}

fn is_settled(status: RecordStatus) -> bool {
    matches!(
        status,
        RecordStatus::Completed | RecordStatus::Duplicate | RecordStatus::Filtered
    )
}

/// Pop the oldest job in `jobs` that ran the same content.
fn take_matching(jobs: &mut VecDeque<ExecutionJob>, hash: &str) -> Option<ExecutionJob> {
    let position = jobs.iter().position(|job| job.run_config_hash == hash)?;
    jobs.remove(position)
}

fn final_status(interrupted: bool, results: &RunResults) -> MasterJobStatus {
    if interrupted {
        MasterJobStatus::Cancelled
    } else if results.output(RecordStatus::Completed).is_empty() {
        MasterJobStatus::Failed
    } else if !results.index(RecordStatus::Failed).is_empty() || !results.dead_letters().is_empty() {
        MasterJobStatus::CompletedWithErrors
    } else {
        MasterJobStatus::Completed
    }
}

/// Persist the final shared state and close out the master job.
async fn finalize(
    durable: Durable,
    state: &SharedState,
    status: MasterJobStatus,
    counters: &RunCounters,
) -> FactoryResult<()> {
    let Durable {
        storage,
        mut master,
        mut request,
    } = durable;

    request.state = state.snapshot();
    storage
        .save_request_config(master.id, &request.to_json()?)
        .await?;

    master.mark_finished(status, counters.totals());
    let end_time = master.end_time.unwrap_or_else(Utc::now);
    storage
        .log_master_job_end(master.id, status, &master.totals, end_time)
        .await?;
    info!(
        master_job_id = %master.id,
        status = %status,
        completed = counters.completed,
        failed = counters.failed,
        dead_lettered = counters.dead_lettered,
        "master job finished"
    );
    Ok(())
}

fn listen_for_interrupt(interrupt: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping run");
            interrupt.cancel();
        }
    })
}
