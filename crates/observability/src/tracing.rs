//! Tracing/logging initialization.
//!
//! JSON lines on stdout, filtered through `RUST_LOG`. The sync pipeline
//! emits structured fields (`job_id`, `subject_id`, `attempt`), so keep
//! targets on for log-based alert routing.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true)
        .try_init();
}
