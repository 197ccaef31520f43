//! Error types for client operations.

use thiserror::Error;

/// Errors that can occur on the client side.
#[derive(Error, Debug)]
pub enum ClientError {
    /// No relay could be resolved to talk to.
    #[error("No relay available: {0}")]
    NoRelayAvailable(String),

    /// A relay rejected the submission.
    #[error("Relay rejected letter ({status}): {message}")]
    RelayRejected {
        /// HTTP status the relay answered with.
        status: u16,
        /// The relay's error message.
        message: String,
    },

    /// Outbound HTTP call failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Envelope sealing or opening failed.
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] courier_crypto::CryptoError),

    /// A response body did not have the expected shape.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl ClientError {
    /// Whether resubmitting the same letter may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::RelayRejected { status: 503, .. })
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
