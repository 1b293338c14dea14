//! Logging setup. Structured logs go to stderr so stdout stays clean.

use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;

/// Initialize the global subscriber. `WIPECAST_LOG` wins over the
/// configured level; calling twice is harmless.
pub fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_env("WIPECAST_LOG")
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
