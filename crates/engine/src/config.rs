//! Factory configuration and its persisted form.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use batchforge_core::Args;
use batchforge_storage::StorageConfig;

use crate::error::FactoryError;
use crate::task::RetryPolicy;

/// Configuration of a [`crate::DataFactory`].
///
/// `storage` is never serialized: a persisted config only describes the run, the
/// backend is whatever the resuming factory was opened with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    #[serde(skip_serializing)]
    pub storage: StorageConfig,
    pub project_name: String,
    /// Registry key of the unit of work.
    pub work: String,
    /// Registry keys of completion hooks, run in order.
    pub on_record_complete: Vec<String>,
    /// Registry keys of error hooks, run in order.
    pub on_record_error: Vec<String>,
    /// Records written per storage transaction.
    pub batch_size: usize,
    /// Completed invocations to stop at; 0 means one per assembled record.
    pub target_count: u64,
    pub max_concurrency: usize,
    pub task_runner_timeout: Duration,
    pub retry: RetryPolicy,
    /// Failures of one input before it is dead-lettered.
    pub dead_queue_threshold: u32,
    /// Consecutive non-completed outcomes that stop the run; 0 disables.
    pub job_run_stop_threshold: usize,
    pub initial_state: Map<String, JsonValue>,
    pub show_progress: bool,
    pub progress_interval: Duration,
    /// Install a Ctrl-C handler for the duration of each run.
    pub handle_interrupts: bool,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Noop,
            project_name: "default".to_string(),
            work: String::new(),
            on_record_complete: Vec::new(),
            on_record_error: Vec::new(),
            batch_size: 1,
            target_count: 0,
            max_concurrency: 10,
            task_runner_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            dead_queue_threshold: 3,
            job_run_stop_threshold: 10,
            initial_state: Map::new(),
            show_progress: true,
            progress_interval: Duration::from_secs(3),
            handle_interrupts: false,
        }
    }
}

impl FactoryConfig {
    pub fn new(work: impl Into<String>) -> Self {
        Self {
            work: work.into(),
            ..Default::default()
        }
    }

    /// Defaults overlaid with `BATCHFORGE_*` environment variables. Unparsable values
    /// are logged and ignored.
    pub fn from_env(work: impl Into<String>) -> Self {
        let mut config = Self::new(work);
        if let Ok(dir) = std::env::var("BATCHFORGE_STORAGE_DIR") {
            if !dir.trim().is_empty() {
                config.storage = StorageConfig::local(dir);
            }
        }
        if let Some(n) = env_parse("BATCHFORGE_MAX_CONCURRENCY") {
            config.max_concurrency = n;
        }
        if let Some(secs) = env_parse::<u64>("BATCHFORGE_TASK_TIMEOUT_SECS") {
            config.task_runner_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse("BATCHFORGE_DEAD_QUEUE_THRESHOLD") {
            config.dead_queue_threshold = n;
        }
        if let Some(n) = env_parse("BATCHFORGE_JOB_RUN_STOP_THRESHOLD") {
            config.job_run_stop_threshold = n;
        }
        if let Some(flag) = env_parse("BATCHFORGE_SHOW_PROGRESS") {
            config.show_progress = flag;
        }
        config
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = name.into();
        self
    }

    pub fn with_completion_hook(mut self, key: impl Into<String>) -> Self {
        self.on_record_complete.push(key.into());
        self
    }

    pub fn with_error_hook(mut self, key: impl Into<String>) -> Self {
        self.on_record_error.push(key.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_target_count(mut self, target_count: u64) -> Self {
        self.target_count = target_count;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_runner_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_dead_queue_threshold(mut self, threshold: u32) -> Self {
        self.dead_queue_threshold = threshold;
        self
    }

    pub fn with_stop_threshold(mut self, threshold: usize) -> Self {
        self.job_run_stop_threshold = threshold;
        self
    }

    pub fn with_initial_state(mut self, state: Map<String, JsonValue>) -> Self {
        self.initial_state = state;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_interrupt_handling(mut self, enabled: bool) -> Self {
        self.handle_interrupts = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), FactoryError> {
        let problem = if self.max_concurrency == 0 {
            Some("max_concurrency must be at least 1")
        } else if self.batch_size == 0 {
            Some("batch_size must be at least 1")
        } else if self.dead_queue_threshold == 0 {
            Some("dead_queue_threshold must be at least 1")
        } else if self.task_runner_timeout.is_zero() {
            Some("task_runner_timeout must be positive")
        } else if self.show_progress && self.progress_interval.is_zero() {
            Some("progress_interval must be positive")
        } else {
            None
        };

        match problem {
            Some(msg) => Err(FactoryError::Configuration(msg.to_string())),
            None => Ok(()),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

/// Settings a resume may change. `target_count` is fixed at the first run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeOptions {
    pub max_concurrency: Option<usize>,
    pub task_runner_timeout: Option<Duration>,
    pub dead_queue_threshold: Option<u32>,
    pub job_run_stop_threshold: Option<usize>,
    pub show_progress: Option<bool>,
}

impl ResumeOptions {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_runner_timeout = Some(timeout);
        self
    }

    pub fn with_dead_queue_threshold(mut self, threshold: u32) -> Self {
        self.dead_queue_threshold = Some(threshold);
        self
    }

    pub fn with_stop_threshold(mut self, threshold: usize) -> Self {
        self.job_run_stop_threshold = Some(threshold);
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = Some(show);
        self
    }

    pub fn apply(&self, config: &mut FactoryConfig) {
        if let Some(n) = self.max_concurrency {
            config.max_concurrency = n;
        }
        if let Some(t) = self.task_runner_timeout {
            config.task_runner_timeout = t;
        }
        if let Some(n) = self.dead_queue_threshold {
            config.dead_queue_threshold = n;
        }
        if let Some(n) = self.job_run_stop_threshold {
            config.job_run_stop_threshold = n;
        }
        if let Some(show) = self.show_progress {
            config.show_progress = show;
        }
    }
}

/// What a master job's config blob holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    pub format_version: u32,
    pub config: FactoryConfig,
    /// Resolved once at the first run.
    pub target_count: u64,
    /// Assembled records, index key included.
    pub inputs: Vec<Args>,
    /// Shared state as of the last time the run finished.
    pub state: Map<String, JsonValue>,
}

impl RequestConfig {
    pub const FORMAT_VERSION: u32 = 1;

    pub fn new(
        config: &FactoryConfig,
        target_count: u64,
        inputs: Vec<Args>,
        state: Map<String, JsonValue>,
    ) -> Self {
        Self {
            format_version: Self::FORMAT_VERSION,
            config: config.clone(),
            target_count,
            inputs,
            state,
        }
    }

    pub fn to_json(&self) -> Result<JsonValue, FactoryError> {
        serde_json::to_value(self).map_err(|e| FactoryError::Configuration(e.to_string()))
    }

    pub fn from_json(value: JsonValue) -> Result<Self, FactoryError> {
        let request: RequestConfig = serde_json::from_value(value)
            .map_err(|e| FactoryError::NotResumable(format!("undecodable request config: {e}")))?;
        if request.format_version != Self::FORMAT_VERSION {
            return Err(FactoryError::NotResumable(format!(
                "unsupported request config version {}",
                request.format_version
            )));
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_documented_values() {
        let config = FactoryConfig::default();
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.task_runner_timeout, Duration::from_secs(60));
        assert_eq!(config.dead_queue_threshold, 3);
        assert_eq!(config.job_run_stop_threshold, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_limits() {
        for config in [
            FactoryConfig::new("w").with_max_concurrency(0),
            FactoryConfig::new("w").with_batch_size(0),
            FactoryConfig::new("w").with_dead_queue_threshold(0),
            FactoryConfig::new("w").with_task_timeout(Duration::ZERO),
        ] {
            assert!(matches!(config.validate(), Err(FactoryError::Configuration(_))));
        }
    }

    #[test]
    fn resume_options_override_selected_fields() {
        let mut config = FactoryConfig::new("w").with_target_count(7);
        ResumeOptions::default()
            .with_max_concurrency(2)
            .with_progress(false)
            .apply(&mut config);
        assert_eq!(config.max_concurrency, 2);
        assert!(!config.show_progress);
        assert_eq!(config.target_count, 7);
        assert_eq!(config.dead_queue_threshold, 3);
    }

    #[test]
    fn request_config_round_trips_without_storage() {
        let config = FactoryConfig::new("w").with_storage(StorageConfig::local("/tmp/x"));
        let mut record = Args::new();
        record.insert("q".into(), json!(1));
        let request = RequestConfig::new(&config, 1, vec![record], Map::new());

        let json = request.to_json().unwrap();
        assert!(json["config"].get("storage").is_none());

        let decoded = RequestConfig::from_json(json).unwrap();
        assert_eq!(decoded.config.storage, StorageConfig::Noop);
        assert_eq!(decoded.config.work, "w");
        assert_eq!(decoded.inputs.len(), 1);
    }

    #[test]
    fn foreign_request_config_is_not_resumable() {
        let err = RequestConfig::from_json(json!({"format_version": 99})).unwrap_err();
        assert!(matches!(err, FactoryError::NotResumable(_)));
    }
}
