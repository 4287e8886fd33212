//! Logging configuration and initialization

use crate::config::EngineConfig;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Initialize tracing for a process driving the engine.
///
/// `RUST_LOG` wins over the configured level. Calling this more than once
/// is harmless: later calls leave the first subscriber in place and return
/// `false`.
pub fn init_logging(config: &EngineConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.verbosity >= 2)
        .with_thread_ids(config.verbosity >= 3)
        .with_line_number(config.verbosity >= 3)
        .try_init()
        .is_ok();

    if installed {
        debug!("steplock logging started with verbosity level: {}", config.verbosity);
    }
    installed
}

/// Initialize tracing with just a verbosity level
pub fn init_tracing(verbosity: u8) -> bool {
    let config = EngineConfig {
        verbosity,
        ..EngineConfig::default()
    };
    init_logging(&config)
}
