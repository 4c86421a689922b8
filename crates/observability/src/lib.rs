//! Process-wide tracing setup shared by batchforge binaries and tests.

/// Initialize JSON logging for the process.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Human-readable logging for local runs.
pub fn init_pretty() {
    tracing::init_pretty();
}

/// Logging captured by the test harness. Defaults to `warn` unless `RUST_LOG` is set.
pub fn init_test() {
    tracing::init_test();
}

/// Tracing configuration (filters, layers).
pub mod tracing;
