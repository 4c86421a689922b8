//! Bounded worker pool draining the input queue.
//!
//! ## Loop
//!
//! 1. Reap finished workers.
//! 2. Check the stop condition.
//! 3. Acquire a permit (at most `max_concurrency` workers in flight).
//! 4. Check the stop condition again; the permit may have been freed by the worker
//!    that reached the target.
//! 5. Pop the next input and spawn a worker holding the permit. If the queue is empty,
//!    release the permit and wait for an in-flight worker (it may requeue a failure);
//!    with nothing in flight the run is drained.
//!
//! On any stop other than draining, in-flight workers are cancelled and every one of
//! them is awaited before the run report is built.
//!
//! All queue and counter bookkeeping happens under one async mutex owned by the
//! scheduler. Hooks never run under it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use batchforge_core::{
    ExecutionJob, ExecutionJobId, MasterJobId, Record, RecordCounts, RecordStatus, content_hash,
    strip_index,
};
use batchforge_storage::Storage;

use crate::config::FactoryConfig;
use crate::queue::{DeadLetterEntry, InputItem, OutputEntry, RunCounters};
use crate::registry::{CompletionHook, ErrorHook, Resolved, WorkFn};
use crate::state::SharedState;
use crate::task::{RetryPolicy, TaskError, run_task};

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub target_count: u64,
    pub dead_queue_threshold: u32,
    /// 0 disables the breaker.
    pub job_run_stop_threshold: usize,
    pub task_timeout: Duration,
    pub retry: RetryPolicy,
    pub batch_size: usize,
}

impl SchedulerConfig {
    pub fn from_factory(config: &FactoryConfig, target_count: u64) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            target_count,
            dead_queue_threshold: config.dead_queue_threshold.max(1),
            job_run_stop_threshold: config.job_run_stop_threshold,
            task_timeout: config.task_runner_timeout,
            retry: config.retry.clone(),
            batch_size: config.batch_size.max(1),
        }
    }
}

/// Where workers record terminal invocations. Absent for dry runs.
#[derive(Clone)]
pub struct Persistence {
    pub storage: Arc<dyn Storage>,
    pub master_job_id: MasterJobId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TargetReached,
    /// The last `job_run_stop_threshold` outcomes were all non-completed.
    CircuitBreaker,
    Interrupted,
    /// Input queue empty with nothing in flight.
    Drained,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::TargetReached => "target_reached",
            StopReason::CircuitBreaker => "circuit_breaker",
            StopReason::Interrupted => "interrupted",
            StopReason::Drained => "drained",
        }
    }
}

/// Initial queue contents. Resume pre-fills outputs and counters.
#[derive(Debug, Default)]
pub struct Seed {
    pub inputs: Vec<InputItem>,
    pub outputs: Vec<OutputEntry>,
    pub counters: RunCounters,
}

#[derive(Debug)]
pub struct RunReport {
    pub output: Vec<OutputEntry>,
    pub dead_letters: Vec<DeadLetterEntry>,
    pub counters: RunCounters,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub counters: RunCounters,
    pub queued: usize,
    pub in_flight: usize,
    pub target_count: u64,
}

/// Read-only view of a running scheduler.
#[derive(Clone)]
pub struct RunMonitor {
    book: Arc<Mutex<RunBook>>,
    target_count: u64,
}

impl RunMonitor {
    pub async fn snapshot(&self) -> ProgressSnapshot {
        let book = self.book.lock().await;
        ProgressSnapshot {
            counters: book.counters,
            queued: book.input.len(),
            in_flight: book.in_flight,
            target_count: self.target_count,
        }
    }
}

#[derive(Debug, Default)]
struct RunBook {
    input: VecDeque<InputItem>,
    output: Vec<OutputEntry>,
    counters: RunCounters,
    failures: HashMap<usize, u32>,
    dead_indices: HashSet<usize>,
    dead_letters: Vec<DeadLetterEntry>,
    in_flight: usize,
    dispatched: u64,
}

#[derive(Clone)]
struct Dispatch {
    item: InputItem,
    attempt: u32,
    worker_id: String,
}

enum Outcome {
    Succeeded {
        status: RecordStatus,
        payloads: Vec<JsonValue>,
    },
    Failed(String),
}

impl RunBook {
    fn take_next(&mut self) -> Option<Dispatch> {
        loop {
            let item = self.input.pop_front()?;
            // A dead-lettered index is never retried, including later cycled copies.
            if self.dead_indices.contains(&item.index) {
                continue;
            }
            let attempt = self.failures.get(&item.index).copied().unwrap_or(0) + 1;
            self.in_flight += 1;
            self.dispatched += 1;
            let worker_id = format!("{}:{}", std::process::id(), self.dispatched);
            return Some(Dispatch {
                item,
                attempt,
                worker_id,
            });
        }
    }

    fn stop_reason(&self, config: &SchedulerConfig) -> Option<StopReason> {
        if self.counters.completed >= config.target_count {
            return Some(StopReason::TargetReached);
        }
        let window = config.job_run_stop_threshold;
        if window > 0
            && self.output.len() >= window
            && self.output[self.output.len() - window..]
                .iter()
                .all(|entry| entry.status != RecordStatus::Completed)
        {
            return Some(StopReason::CircuitBreaker);
        }
        None
    }

    fn finish(
        &mut self,
        dispatch: Dispatch,
        outcome: Outcome,
        execution_job_id: Option<ExecutionJobId>,
        dead_queue_threshold: u32,
    ) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let Dispatch { item, attempt, .. } = dispatch;

        match outcome {
            Outcome::Succeeded { status, payloads } => {
                self.counters.record(status);
                self.output.push(OutputEntry {
                    index: item.index,
                    status,
                    payloads,
                    error: None,
                    execution_job_id,
                    attempt,
                });
            }
            Outcome::Failed(message) => {
                self.output.push(OutputEntry {
                    index: item.index,
                    status: RecordStatus::Failed,
                    payloads: Vec::new(),
                    error: Some(message.clone()),
                    execution_job_id,
                    attempt,
                });

                let failures = self.failures.entry(item.index).or_insert(0);
                *failures += 1;
                if *failures >= dead_queue_threshold {
                    let attempts = *failures;
                    self.counters.record_dead_letter();
                    self.dead_indices.insert(item.index);
                    warn!(index = item.index, attempts, error = %message, "input dead-lettered");
                    self.dead_letters.push(DeadLetterEntry {
                        index: item.index,
                        args: item.args,
                        attempts,
                        last_error: message,
                        dead_lettered_at: Utc::now(),
                    });
                } else {
                    self.counters.record(RecordStatus::Failed);
                    debug!(index = item.index, failures = *failures, "requeueing failed input");
                    self.input.push_back(item);
                }
            }
        }
    }

    fn cancel(&mut self, dispatch: &Dispatch) {
        self.in_flight = self.in_flight.saturating_sub(1);
        debug!(index = dispatch.item.index, "invocation cancelled");
    }
}

struct Shared {
    config: SchedulerConfig,
    work: Arc<dyn WorkFn>,
    on_complete: Vec<CompletionHook>,
    on_error: Vec<ErrorHook>,
    state: SharedState,
    persistence: Option<Persistence>,
    book: Arc<Mutex<RunBook>>,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    interrupt: CancellationToken,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        resolved: &Resolved,
        state: SharedState,
        persistence: Option<Persistence>,
        seed: Seed,
    ) -> Self {
        let book = RunBook {
            input: seed.inputs.into(),
            output: seed.outputs,
            counters: seed.counters,
            ..Default::default()
        };
        Self {
            shared: Arc::new(Shared {
                config,
                work: resolved.work.func(),
                on_complete: resolved.on_complete.clone(),
                on_error: resolved.on_error.clone(),
                state,
                persistence,
                book: Arc::new(Mutex::new(book)),
            }),
            interrupt: CancellationToken::new(),
        }
    }

    /// Stop the run (as interrupted) when `token` fires.
    pub fn with_interrupt(mut self, token: CancellationToken) -> Self {
        self.interrupt = token;
        self
    }

    pub fn monitor(&self) -> RunMonitor {
        RunMonitor {
            book: self.shared.book.clone(),
            target_count: self.shared.config.target_count,
        }
    }

    pub async fn run(self) -> RunReport {
        let Scheduler { shared, interrupt } = self;
        let semaphore = Arc::new(Semaphore::new(shared.config.max_concurrency));
        let cancel = CancellationToken::new();
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut running: HashMap<Id, Dispatch> = HashMap::new();

        let stop_reason = loop {
            while let Some(joined) = tasks.try_join_next_with_id() {
                reap(&shared, &mut running, joined).await;
            }

            if let Some(reason) = check_stop(&shared, &interrupt).await {
                break reason;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break StopReason::Drained,
                },
                _ = interrupt.cancelled() => break StopReason::Interrupted,
            };

            if let Some(reason) = check_stop(&shared, &interrupt).await {
                break reason;
            }

            let next = shared.book.lock().await.take_next();
            match next {
                Some(dispatch) => {
                    let handle = tasks.spawn(execute(
                        shared.clone(),
                        dispatch.clone(),
                        cancel.clone(),
                        permit,
                    ));
                    running.insert(handle.id(), dispatch);
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        joined = tasks.join_next_with_id() => match joined {
                            Some(joined) => reap(&shared, &mut running, joined).await,
                            None => break StopReason::Drained,
                        },
                        _ = interrupt.cancelled() => break StopReason::Interrupted,
                    }
                }
            }
        };

        if stop_reason != StopReason::Drained {
            debug!(reason = stop_reason.as_str(), in_flight = tasks.len(), "stopping workers");
            cancel.cancel();
        }
        while let Some(joined) = tasks.join_next_with_id().await {
            reap(&shared, &mut running, joined).await;
        }

        let mut book = shared.book.lock().await;
        RunReport {
            output: std::mem::take(&mut book.output),
            dead_letters: std::mem::take(&mut book.dead_letters),
            counters: book.counters,
            stop_reason,
        }
    }
}

async fn check_stop(shared: &Shared, interrupt: &CancellationToken) -> Option<StopReason> {
    if interrupt.is_cancelled() {
        return Some(StopReason::Interrupted);
    }
    shared.book.lock().await.stop_reason(&shared.config)
}

/// Settle one joined worker. A worker that panicked, in the work function or in a
/// hook, counts as a failed invocation of its input.
async fn reap(
    shared: &Shared,
    running: &mut HashMap<Id, Dispatch>,
    joined: Result<(Id, ()), JoinError>,
) {
    let (id, panic) = match joined {
        Ok((id, ())) => (id, None),
        Err(e) => (e.id(), e.is_panic().then(|| e.to_string())),
    };
    let Some(dispatch) = running.remove(&id) else {
        return;
    };
    let Some(panic) = panic else {
        return;
    };

    error!(index = dispatch.item.index, attempt = dispatch.attempt, error = %panic, "worker panicked");
    shared.book.lock().await.finish(
        dispatch,
        Outcome::Failed(format!("worker panicked: {panic}")),
        None,
        shared.config.dead_queue_threshold,
    );
}

async fn execute(
    shared: Arc<Shared>,
    dispatch: Dispatch,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let started_at = Utc::now();
    let result = run_task(
        shared.work.as_ref(),
        &dispatch.item.args,
        shared.config.task_timeout,
        &shared.config.retry,
        &cancel,
    )
    .await;

    let outcome = match result {
        Ok(payloads) => Outcome::Succeeded {
            status: classify(&payloads, &shared.on_complete, &shared.state),
            payloads,
        },
        Err(TaskError::Cancelled) => {
            shared.book.lock().await.cancel(&dispatch);
            return;
        }
        Err(e) => {
            let message = e.to_string();
            for hook in &shared.on_error {
                hook(&message, &shared.state);
            }
            Outcome::Failed(message)
        }
    };

    let execution_job_id = match &shared.persistence {
        Some(persistence) => {
            persist(
                persistence,
                &dispatch,
                &outcome,
                started_at,
                shared.config.batch_size,
            )
            .await
        }
        None => None,
    };

    match &outcome {
        Outcome::Succeeded { status, payloads } => debug!(
            index = dispatch.item.index,
            attempt = dispatch.attempt,
            status = %status,
            payloads = payloads.len(),
            "invocation finished"
        ),
        Outcome::Failed(message) => debug!(
            index = dispatch.item.index,
            attempt = dispatch.attempt,
            error = %message,
            "invocation failed"
        ),
    }

    shared.book.lock().await.finish(
        dispatch,
        outcome,
        execution_job_id,
        shared.config.dead_queue_threshold,
    );
}

/// Every hook runs once per payload. Any duplicate verdict wins over filtered.
fn classify(payloads: &[JsonValue], hooks: &[CompletionHook], state: &SharedState) -> RecordStatus {
    let mut duplicate = false;
    let mut filtered = false;
    for payload in payloads {
        for hook in hooks {
            match hook(payload, state) {
                Some(RecordStatus::Duplicate) => duplicate = true,
                Some(RecordStatus::Filtered) => filtered = true,
                _ => {}
            }
        }
    }
    if duplicate {
        RecordStatus::Duplicate
    } else if filtered {
        RecordStatus::Filtered
    } else {
        RecordStatus::Completed
    }
}

/// Record one terminal invocation. Storage failures are logged and swallowed; the
/// returned id is `None` when the execution job row could not be written.
async fn persist(
    persistence: &Persistence,
    dispatch: &Dispatch,
    outcome: &Outcome,
    started_at: DateTime<Utc>,
    batch_size: usize,
) -> Option<ExecutionJobId> {
    let storage = persistence.storage.as_ref();
    let args = &dispatch.item.args;
    let mut job = ExecutionJob::new(
        persistence.master_job_id,
        dispatch.item.index as u64,
        JsonValue::Object(strip_index(args.clone())),
        content_hash(args),
        dispatch.worker_id.clone(),
        dispatch.attempt,
    );
    job.creation_time = started_at;
    job.start_time = Some(started_at);

    if let Err(e) = storage.log_execution_job_start(&job).await {
        warn!(index = dispatch.item.index, error = %e, "failed to log execution job start");
        return None;
    }

    let (status, error, records) = match outcome {
        Outcome::Succeeded { status, payloads } => {
            let mut written = 0u64;
            let mut batch = Vec::with_capacity(batch_size.min(payloads.len()));
            for payload in payloads {
                let record = Record::for_job(&job, *status);
                let record = match storage.save_record_data(record.id, payload).await {
                    Ok(output_ref) => record.with_output_ref(output_ref),
                    Err(e) => {
                        warn!(record_id = %record.id, error = %e, "failed to store record payload");
                        record.with_error(e.to_string())
                    }
                };
                batch.push(record);
                if batch.len() >= batch_size {
                    written += flush_records(storage, &mut batch).await;
                }
            }
            written += flush_records(storage, &mut batch).await;
            (*status, None, written)
        }
        Outcome::Failed(message) => {
            let mut batch = vec![Record::for_job(&job, RecordStatus::Failed).with_error(message.clone())];
            let written = flush_records(storage, &mut batch).await;
            (RecordStatus::Failed, Some(message.as_str()), written)
        }
    };

    let counts = RecordCounts::uniform(status, records);
    if let Err(e) = storage
        .log_execution_job_end(job.id, status, &counts, error, Utc::now())
        .await
    {
        warn!(execution_job_id = %job.id, error = %e, "failed to log execution job end");
    }
    Some(job.id)
}

async fn flush_records(storage: &dyn Storage, batch: &mut Vec<Record>) -> u64 {
    if batch.is_empty() {
        return 0;
    }
    let count = batch.len() as u64;
    let result = storage.log_records_batch(batch).await;
    batch.clear();
    match result {
        Ok(()) => count,
        Err(e) => {
            warn!(records = count, error = %e, "failed to log record batch");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use batchforge_core::{Args, INDEX_KEY};
    use serde_json::json;

    use crate::registry::Registry;

    fn config(target_count: u64) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrency: 4,
            target_count,
            dead_queue_threshold: 3,
            job_run_stop_threshold: 0,
            task_timeout: Duration::from_secs(5),
            retry: RetryPolicy::no_retry(),
            batch_size: 1,
        }
    }

    fn items(n: usize) -> Vec<InputItem> {
        (0..n)
            .map(|index| {
                let mut args = Args::new();
                args.insert("n".into(), json!(index));
                args.insert(INDEX_KEY.into(), json!(index));
                InputItem { index, args }
            })
            .collect()
    }

    fn resolved(registry: &Registry, hooks: &[&str]) -> Resolved {
        let hooks: Vec<String> = hooks.iter().map(|h| h.to_string()).collect();
        registry.resolve("work", &hooks, &[]).unwrap()
    }

    fn seed(n: usize) -> Seed {
        Seed {
            inputs: items(n),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn drains_every_input_once() {
        let mut registry = Registry::new();
        registry.register_work("work", |args: Args| async move {
            Ok::<_, anyhow::Error>(vec![args["n"].clone()])
        });

        let report = Scheduler::new(config(8), &resolved(&registry, &[]), SharedState::default(), None, seed(8))
            .run()
            .await;

        assert_eq!(report.stop_reason, StopReason::TargetReached);
        assert_eq!(report.counters.completed, 8);
        assert_eq!(report.counters.total_attempted, 8);
        let mut indices: Vec<usize> = report.output.iter().map(|e| e.index).collect();
        indices.sort();
        assert_eq!(indices, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn never_exceeds_max_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());

        let mut registry = Registry::new();
        registry.register_work("work", move |_args: Args| {
            let (running, peak) = (r.clone(), p.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(vec![json!(1)])
            }
        });

        let cfg = SchedulerConfig {
            max_concurrency: 3,
            ..config(20)
        };
        let report = Scheduler::new(cfg, &resolved(&registry, &[]), SharedState::default(), None, seed(20))
            .run()
            .await;
        assert_eq!(report.counters.completed, 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn failures_requeue_then_dead_letter() {
        let mut registry = Registry::new();
        registry.register_work("work", |args: Args| async move {
            if args["n"] == json!(1) {
                anyhow::bail!("bad input");
            }
            Ok(vec![json!("ok")])
        });

        let cfg = SchedulerConfig {
            dead_queue_threshold: 2,
            ..config(3)
        };
        let report = Scheduler::new(cfg, &resolved(&registry, &[]), SharedState::default(), None, seed(3))
            .run()
            .await;

        assert_eq!(report.stop_reason, StopReason::Drained);
        assert_eq!(report.counters.completed, 2);
        assert_eq!(report.counters.failed, 1);
        assert_eq!(report.counters.dead_lettered, 1);
        assert_eq!(report.counters.total_attempted, 4);
        assert_eq!(report.dead_letters.len(), 1);
        assert_eq!(report.dead_letters[0].index, 1);
        assert_eq!(report.dead_letters[0].attempts, 2);

        let attempts: Vec<u32> = report
            .output
            .iter()
            .filter(|e| e.index == 1)
            .map(|e| e.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test]
    async fn hooks_reclassify_with_duplicate_winning() {
        let mut registry = Registry::new();
        registry
            .register_work("work", |args: Args| async move {
                Ok::<_, anyhow::Error>(vec![args["n"].clone(), json!("extra")])
            })
            .register_completion_hook("dedupe", |payload, state| {
                let key = payload.to_string();
                let seen = state.update(|map| map.insert(key, json!(true)).is_some());
                seen.then_some(RecordStatus::Duplicate)
            })
            .register_completion_hook("odd", |payload, _| {
                (payload.as_u64().is_some_and(|n| n % 2 == 1)).then_some(RecordStatus::Filtered)
            });

        let cfg = SchedulerConfig {
            max_concurrency: 1,
            ..config(10)
        };
        let report = Scheduler::new(cfg, &resolved(&registry, &["dedupe", "odd"]), SharedState::default(), None, seed(4))
            .run()
            .await;

        let status_of = |index: usize| {
            report
                .output
                .iter()
                .find(|e| e.index == index)
                .map(|e| e.status)
                .unwrap()
        };
        // Index 0 is the first to emit "extra"; every later record repeats it.
        assert_eq!(status_of(0), RecordStatus::Completed);
        assert_eq!(status_of(1), RecordStatus::Duplicate);
        assert_eq!(status_of(2), RecordStatus::Duplicate);
        assert_eq!(report.counters.duplicate, 3);
        assert_eq!(report.counters.completed, 1);
    }

    #[tokio::test]
    async fn circuit_breaker_stops_a_failing_run() {
        let mut registry = Registry::new();
        registry.register_work("work", |_args: Args| async {
            Err::<Vec<JsonValue>, _>(anyhow::anyhow!("down"))
        });

        let cfg = SchedulerConfig {
            max_concurrency: 1,
            job_run_stop_threshold: 3,
            dead_queue_threshold: 100,
            ..config(10)
        };
        let report = Scheduler::new(cfg, &resolved(&registry, &[]), SharedState::default(), None, seed(10))
            .run()
            .await;
        assert_eq!(report.stop_reason, StopReason::CircuitBreaker);
        assert_eq!(report.output.len(), 3);
    }

    #[tokio::test]
    async fn panicking_hook_counts_as_a_failed_invocation() {
        let mut registry = Registry::new();
        registry
            .register_work("work", |args: Args| async move {
                Ok::<_, anyhow::Error>(vec![args["n"].clone()])
            })
            .register_completion_hook("fragile", |payload, _| {
                if payload == &json!(1) {
                    panic!("hook cannot handle 1");
                }
                None
            });

        let cfg = SchedulerConfig {
            dead_queue_threshold: 2,
            ..config(3)
        };
        let scheduler = Scheduler::new(cfg, &resolved(&registry, &["fragile"]), SharedState::default(), None, seed(3));
        let monitor = scheduler.monitor();
        let report = scheduler.run().await;

        assert_eq!(report.stop_reason, StopReason::Drained);
        assert_eq!(report.counters.completed, 2);
        assert_eq!(report.counters.failed, 1);
        assert_eq!(report.counters.dead_lettered, 1);
        assert_eq!(report.dead_letters.len(), 1);
        assert_eq!(report.dead_letters[0].index, 1);
        assert!(report.dead_letters[0].last_error.contains("worker panicked"));
        assert_eq!(monitor.snapshot().await.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_cancels_in_flight_work() {
        let mut registry = Registry::new();
        registry.register_work("work", |_args: Args| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, anyhow::Error>(vec![json!(1)])
        });

        let token = CancellationToken::new();
        let handle = token.clone();
        let scheduler = Scheduler::new(
            SchedulerConfig {
                task_timeout: Duration::from_secs(7200),
                ..config(4)
            },
            &resolved(&registry, &[]),
            SharedState::default(),
            None,
            seed(4),
        )
        .with_interrupt(token);
        let monitor = scheduler.monitor();

        let run = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(monitor.snapshot().await.in_flight, 4);
        handle.cancel();

        let report = run.await.unwrap();
        assert_eq!(report.stop_reason, StopReason::Interrupted);
        assert!(report.output.is_empty());
        assert_eq!(monitor.snapshot().await.in_flight, 0);
    }

    #[tokio::test]
    async fn seeded_outputs_count_toward_the_target() {
        let mut registry = Registry::new();
        registry.register_work("work", |_args: Args| async {
            Ok::<_, anyhow::Error>(vec![json!("fresh")])
        });

        let seed = Seed {
            inputs: items(1),
            outputs: vec![OutputEntry {
                index: 1,
                status: RecordStatus::Completed,
                payloads: vec![json!("stored")],
                error: None,
                execution_job_id: None,
                attempt: 1,
            }],
            counters: RunCounters {
                completed: 1,
                total_attempted: 1,
                ..Default::default()
            },
        };
        let report = Scheduler::new(config(2), &resolved(&registry, &[]), SharedState::default(), None, seed)
            .run()
            .await;
        assert_eq!(report.counters.completed, 2);
        assert_eq!(report.output.len(), 2);
        assert_eq!(report.stop_reason, StopReason::TargetReached);
    }
}
