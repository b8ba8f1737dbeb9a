//! Unified error types for Turbot

use thiserror::Error;

/// Unified error type for all Turbot operations
#[derive(Error, Debug)]
pub enum TurbotError {
    // Version control errors
    #[error("Git command failed: {0}")]
    GitCommand(String),

    // Dependency install errors
    #[error("Install failed: {0}")]
    Install(String),

    // Worker process errors
    #[error("Failed to launch worker: {0}")]
    Launch(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Service control failed: {0}")]
    Service(String),

    #[error("Command timed out after {secs}s: {command}")]
    Timeout { command: String, secs: u64 },

    // Deploy coordination errors
    #[error("Deploy lock error: {0}")]
    Lock(String),

    #[error("Status mailbox error: {0}")]
    Status(String),

    #[error("Shutdown request failed: {0}")]
    ShutdownRequest(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias using TurbotError
pub type Result<T> = std::result::Result<T, TurbotError>;
