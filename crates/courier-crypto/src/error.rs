//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Decryption failed (invalid ciphertext or key).
    #[error("Decryption failed: invalid ciphertext or key")]
    Decryption,

    /// Invalid key length.
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length.
        expected: usize,
        /// Actual key length.
        actual: usize,
    },

    /// Invalid nonce length.
    #[error("Invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength {
        /// Expected nonce length.
        expected: usize,
        /// Actual nonce length.
        actual: usize,
    },

    /// Malformed envelope encoding.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Invalid hex string format.
    #[error("Invalid hex string: {0}")]
    InvalidHexFormat(String),

    /// Key file I/O failed.
    #[error("Key file error: {0}")]
    KeyFile(#[from] std::io::Error),
}

/// Result type for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
