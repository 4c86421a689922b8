//! `batchforge-engine`: runs a registered unit of work over assembled input records.
//!
//! - `registry`: named work functions and completion/error hooks.
//! - `task`: one invocation with timeout, retry and cancellation.
//! - `scheduler`: bounded concurrency, requeue, dead letters and stop conditions.
//! - `orchestrator`: [`DataFactory`], the normal / dry-run / resume entry points.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod results;
pub mod scheduler;
pub mod state;
pub mod task;
pub mod telemetry;

pub use config::{FactoryConfig, RequestConfig, ResumeOptions};
pub use error::{FactoryError, FactoryResult};
pub use orchestrator::{DataFactory, RunMode};
pub use queue::{DeadLetterEntry, InputItem, OutputEntry, RunCounters};
pub use registry::{CompletionHook, ErrorHook, Registry, Resolved, WorkFn, WorkSpec};
pub use results::RunResults;
pub use scheduler::{ProgressSnapshot, RunMonitor, RunReport, Scheduler, SchedulerConfig, StopReason};
pub use state::SharedState;
pub use task::{BackoffStrategy, RetryPolicy, TaskError, run_task};
pub use tokio_util::sync::CancellationToken;
pub use telemetry::{NoopTelemetry, TelemetryEvent, TelemetrySink, TracingTelemetry};

pub use batchforge_core::{Args, Inputs, MasterJobId, MasterJobStatus, RecordStatus};
pub use batchforge_storage::StorageConfig;
