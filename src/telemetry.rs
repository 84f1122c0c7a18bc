//! Tracing subscriber setup for the daemon binary.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Initialise once at process start. `RUST_LOG` wins over the config
/// level when set.
pub fn init(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level_main.clone()));
    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
    if result.is_err() {
        tracing::debug!("telemetry already initialised");
    }
}
