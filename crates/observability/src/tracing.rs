//! Tracing/logging initialization.
//!
//! Store operations are instrumented spans carrying `command_id` and
//! `target`; executors and the worker loop log outcome classification and
//! lease churn as events. The JSON output keeps the current span's fields on
//! every line so a single grep by `command_id` reconstructs one command's
//! history across lease, heartbeat and terminal write.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Filtering comes from `RUST_LOG`; the default keeps workers at `info`.
/// Lease acquisition, heartbeat loss and superseded terminal writes are
/// logged at `debug` (`anvil_worker=debug,anvil_store=debug` when diagnosing
/// a queue). Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .with_span_list(false)
        .with_target(false)
        .try_init();
}
