//! Structured logging setup.
//!
//! Installs a global `tracing` subscriber configured from [`LoggingConfig`]. The
//! `RUST_LOG` environment variable, when set, overrides the configured level.

use crate::config::LoggingConfig;
use crate::error::{Result, TransportError};
use tracing_subscriber::EnvFilter;

/// Install the process-wide subscriber
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| TransportError::ConfigError(format!("Failed to install logger: {e}")))?;

    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
