//! Tracing subscriber setup

use crate::config::LoggingConfig;
use crate::error::{BridgeError, Result};
use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber for the given logging section.
///
/// `RUST_LOG` takes precedence over `config.level`. Fails if a global
/// subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| BridgeError::Config(format!("invalid log level '{}': {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "pretty" => builder.pretty().try_init(),
        "compact" => builder.compact().try_init(),
        other => {
            return Err(BridgeError::Config(format!(
                "unknown log format '{}'",
                other
            )));
        }
    };

    installed.map_err(|e| BridgeError::Config(format!("logging already initialised: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_format_rejected() {
        let config = LoggingConfig {
            level: "info".to_string(),
            format: "xml".to_string(),
        };
        assert!(matches!(init(&config), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_second_init_fails_cleanly() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: "compact".to_string(),
        };
        // Another test in the binary may have installed a subscriber first
        let _ = init(&config);
        assert!(init(&config).is_err());
    }
}
