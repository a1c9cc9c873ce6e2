//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::ArbiterConfig;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` when the variable is unset or invalid.
///
/// Returns `false` if a global subscriber was already installed, which makes
/// repeated calls (tests, embedding applications) harmless.
pub fn init_tracing(default_directive: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_directive))
        .with_target(true)
        .try_init()
        .is_ok()
}

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// [`init_tracing`] with the configured log level.
pub fn init_from_config(config: &ArbiterConfig) -> bool {
    init_tracing(&config.log_level)
}
