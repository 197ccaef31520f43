//! Error types for directory operations.

use thiserror::Error;

/// Errors that can occur in the directory authority.
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A heartbeat payload was missing required fields.
    #[error("Invalid heartbeat: {0}")]
    InvalidHeartbeat(String),

    /// Outbound HTTP call failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type for directory operations.
pub type Result<T> = std::result::Result<T, DirectoryError>;
