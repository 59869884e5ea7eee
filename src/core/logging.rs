//! Tracing setup for the `cairn` binary.
//!
//! Logs go to stderr so stdout carries only JSON envelopes.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "CAIRN_LOG";

/// Install the global subscriber. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
