//! One unit-of-work invocation under a timeout with bounded retries.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use batchforge_core::{Args, strip_index};

use crate::registry::WorkFn;

/// Why an invocation produced no payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The attempt ran past the task timeout. Never retried.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed after {attempts} attempt(s): {message}")]
    Failed { attempts: u32, message: String },

    /// The run stopped while the invocation was in flight.
    #[error("cancelled")]
    Cancelled,
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy for failing invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay after failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => (base_ms * 2_f64.powi((attempt - 1) as i32)).min(max_ms),
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread around the nominal delay.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt follows failed attempt `attempt` (1-indexed).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

/// Invoke `work` with `args` (index key stripped), retrying failures per `policy`.
///
/// Each attempt gets a fresh copy of the arguments. Cancellation is observed both
/// during the call and during backoff.
pub async fn run_task(
    work: &dyn WorkFn,
    args: &Args,
    timeout: Duration,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Vec<JsonValue>, TaskError> {
    let args = strip_index(args.clone());
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let outcome = tokio::select! {
            outcome = tokio::time::timeout(timeout, work.call(args.clone())) => outcome,
            _ = cancel.cancelled() => return Err(TaskError::Cancelled),
        };

        let error = match outcome {
            Err(_) => return Err(TaskError::Timeout(timeout)),
            Ok(Ok(payloads)) => return Ok(payloads),
            Ok(Err(error)) => error,
        };

        if !policy.should_retry(attempt) {
            return Err(TaskError::Failed {
                attempts: attempt,
                message: format!("{error:#}"),
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying unit of work");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(TaskError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use batchforge_core::INDEX_KEY;
    use serde_json::json;

    struct Flaky {
        calls: Arc<AtomicU32>,
        fail_first: u32,
    }

    #[async_trait::async_trait]
    impl WorkFn for Flaky {
        async fn call(&self, args: Args) -> anyhow::Result<Vec<JsonValue>> {
            assert!(!args.contains_key(INDEX_KEY));
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                anyhow::bail!("transient failure {n}");
            }
            Ok(vec![JsonValue::Object(args)])
        }
    }

    fn indexed_args() -> Args {
        let mut args = Args::new();
        args.insert("q".into(), json!("x"));
        args.insert(INDEX_KEY.into(), json!(4));
        args
    }

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10))
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn backoff_respects_max_delay_and_jitter_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..20 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay <= Duration::from_millis(33_000), "attempt {attempt}: {delay:?}");
        }
        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_secs(3));
    }

    #[test]
    fn max_attempts_counts_retries() {
        let policy = quick(2);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[tokio::test]
    async fn retries_until_success_without_index_key() {
        let calls = Arc::new(AtomicU32::new(0));
        let work = Flaky {
            calls: calls.clone(),
            fail_first: 2,
        };
        let out = run_task(&work, &indexed_args(), Duration::from_secs(1), &quick(3), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, vec![json!({"q": "x"})]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts_and_last_error() {
        let work = Flaky {
            calls: Arc::new(AtomicU32::new(0)),
            fail_first: u32::MAX,
        };
        let err = run_task(&work, &indexed_args(), Duration::from_secs(1), &quick(2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TaskError::Failed {
                attempts: 3,
                message: "transient failure 3".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let slow = move |_args: Args| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, anyhow::Error>(Vec::new())
            }
        };
        let err = run_task(&slow, &indexed_args(), Duration::from_secs(1), &quick(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::Timeout(Duration::from_secs(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_call() {
        let token = CancellationToken::new();
        let handle = token.clone();
        let slow = |_args: Args| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, anyhow::Error>(vec![json!(1)])
        };
        let task = tokio::spawn(async move {
            run_task(&slow, &Args::new(), Duration::from_secs(120), &quick(0), &token).await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
        assert_eq!(task.await.unwrap(), Err(TaskError::Cancelled));
    }
}
