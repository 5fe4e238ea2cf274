use std::path::PathBuf;
use thiserror::Error;

use crate::supervisor::InstanceId;

/// Main error type for the Vigil supervisor
#[derive(Debug, Error)]
pub enum VigilError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // Startup errors (fatal to start)
    #[error("Script not found: {0}")]
    ScriptNotFound(PathBuf),

    #[error("Interpreter not found: {0}")]
    InterpreterNotFound(PathBuf),

    #[error("Failed to spawn instance {0}: {1}")]
    SpawnError(InstanceId, String),

    // Log errors
    #[error("Log error: {0}")]
    LogError(String),

    #[error("Failed to open log file {}: {reason}", path.display())]
    LogFileError { path: PathBuf, reason: String },

    // Supervision errors
    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("Restart budget exhausted for instance {0}")]
    RestartBudgetExhausted(InstanceId),

    #[error("All instances have failed permanently")]
    AllInstancesFailed,

    #[error("Instance {0} did not exit within the grace period")]
    ShutdownTimeout(InstanceId),

    #[error("Signal error: {0}")]
    SignalError(String),

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Vigil operations
pub type Result<T> = std::result::Result<T, VigilError>;
