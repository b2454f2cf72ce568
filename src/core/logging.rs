//! Process-wide `tracing` subscriber for the binary.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "APPDECK_LOG";

/// Install a fmt subscriber filtered by `APPDECK_LOG` (default `info`), writing to stderr so
/// JSON envelopes on stdout stay machine-readable. Safe to call more than once.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
