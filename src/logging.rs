//! Structured logging configuration using tracing

use crate::error::{LumiflowError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Logging configuration.
///
/// `filter` takes env-filter directives (e.g. `"info"` or
/// `"lumiflow::store=debug,info"`); `json` selects machine-readable output.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: true,
        }
    }
}

/// Initialize the global subscriber with the given configuration.
///
/// Logs go to stderr. Fails if a subscriber was already installed or the
/// filter directives do not parse.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.filter)
        .map_err(|e| LumiflowError::Other(format!("bad log filter: {}", e)))?;

    if config.json {
        let subscriber = fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| LumiflowError::Other(e.to_string()))?;
    } else {
        let subscriber = fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| LumiflowError::Other(e.to_string()))?;
    }

    Ok(())
}
