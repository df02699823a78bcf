//! Logging setup

use bridge_config::ObservabilityConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{BridgeError, Result};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Returns
/// `Ok(false)` if a global subscriber was already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|e| {
            BridgeError::Configuration(format!("invalid log level {}: {}", config.log_level, e))
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json_logging {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };

    Ok(installed.is_ok())
}
