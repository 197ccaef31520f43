//! Error types for ledger operations.

use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Error, Debug)]
pub enum ChainError {
    /// The chain has no blocks.
    #[error("Chain is empty")]
    EmptyChain,

    /// A block failed validation. Carries the index of the first failure.
    #[error("Block {index} invalid: {reason}")]
    InvalidBlock {
        /// Index of the first failing block.
        index: u64,
        /// What went wrong.
        reason: String,
    },

    /// The on-disk chain file is corrupt.
    #[error("Chain file corrupt: {0}")]
    CorruptChainFile(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, ChainError>;
