//! Tracing subscriber setup for binaries

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info,parley=debug";

/// Install the global fmt subscriber
///
/// Honors `RUST_LOG`; falls back to [`DEFAULT_LOG_FILTER`]. Calling this more
/// than once is harmless, later calls are ignored.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
