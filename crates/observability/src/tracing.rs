//! Tracing/logging initialization.
//!
//! All entry points read `RUST_LOG` and fall back to a fixed default directive.

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "info";

fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// JSON logs with timestamps.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or(DEFAULT_DIRECTIVE))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .with_current_span(true)
        .try_init();
}

fn pretty_subscriber() -> impl ::tracing::Subscriber + Send + Sync {
    tracing_subscriber::fmt()
        .with_env_filter(filter_or(DEFAULT_DIRECTIVE))
        .compact()
        .with_target(false)
        .finish()
}

/// Compact single-line logs for terminals.
pub fn init_pretty() {
    let _ = ::tracing::subscriber::set_global_default(pretty_subscriber());
}

pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or("warn"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn repeated_init_is_a_no_op() {
        super::init_test();
        super::init_test();
        super::init();
        super::init_pretty();
        ::tracing::info!("still logging");
    }

    #[test]
    fn pretty_subscriber_handles_span_fields() {
        ::tracing::subscriber::with_default(super::pretty_subscriber(), || {
            let span = ::tracing::info_span!("run", master_job_id = "m-1");
            let _entered = span.enter();
            ::tracing::info!(records = 3, "master job started");
        });
    }
}
