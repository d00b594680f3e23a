//! Error types for lumiflow

use thiserror::Error;

/// Lumiflow error types
#[derive(Error, Debug)]
pub enum LumiflowError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Task report parse errors
    #[error("Report parse error: {0}")]
    ReportParse(#[from] serde_json::Error),

    /// Configuration parse errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Workflow label validation error
    #[error("Invalid workflow label '{0}': must match [A-Za-z][A-Za-z0-9_]*")]
    InvalidLabel(String),

    /// Lookup of a label with no registered workflow
    #[error("Unknown workflow '{0}'")]
    UnknownWorkflow(String),

    /// A retried store mutation that never went through
    #[error("Store mutation failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias using LumiflowError
pub type Result<T> = std::result::Result<T, LumiflowError>;
