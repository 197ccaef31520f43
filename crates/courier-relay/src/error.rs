//! Error types for relay operations.
//!
//! The write worker is the single policy point for retry versus reject, so
//! every error carries its retryability and the HTTP status it maps to at
//! the API boundary.

use courier_chain::ChainError;
use thiserror::Error;

/// Errors that can occur while operating a relay.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Missing or malformed request fields. Caller-fixable.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Ledger validation failure or broken chain link. Never retried,
    /// never silently repaired.
    #[error("Ledger invariant violated: {0}")]
    InvariantViolation(String),

    /// Filesystem or network glitch. Retryable.
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    /// Pre-write sync refused. Retryable, except the bootstrap bypass which
    /// the worker treats as success before this error is ever built.
    #[error("Sync blocked: {0}")]
    SyncBlocked(String),

    /// Queue cleared or node shutting down.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl RelayError {
    /// Whether the write worker should keep the entry and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::TransientIo(_) | RelayError::SyncBlocked(_))
    }

    /// HTTP status this error maps to at the API boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::InvalidInput(_) => 400,
            RelayError::TransientIo(_) | RelayError::SyncBlocked(_) => 503,
            RelayError::InvariantViolation(_) | RelayError::Cancelled(_) => 500,
        }
    }
}

impl From<ChainError> for RelayError {
    fn from(error: ChainError) -> Self {
        match error {
            // Plumbing failures are worth retrying; broken chains are not.
            ChainError::Io(e) => RelayError::TransientIo(e.to_string()),
            ChainError::Serialization(e) => RelayError::TransientIo(e.to_string()),
            // A latent chain fills on the next successful sync.
            ChainError::EmptyChain => {
                RelayError::TransientIo("active chain has no blocks yet".to_string())
            }
            other => RelayError::InvariantViolation(other.to_string()),
        }
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_by_class() {
        assert!(RelayError::TransientIo("disk".into()).is_retryable());
        assert!(RelayError::SyncBlocked("upstream".into()).is_retryable());
        assert!(!RelayError::InvalidInput("missing payload".into()).is_retryable());
        assert!(!RelayError::InvariantViolation("bad link".into()).is_retryable());
        assert!(!RelayError::Cancelled("queue cleared".into()).is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(RelayError::InvalidInput("x".into()).status_code(), 400);
        assert_eq!(RelayError::SyncBlocked("x".into()).status_code(), 503);
        assert_eq!(RelayError::TransientIo("x".into()).status_code(), 503);
        assert_eq!(RelayError::InvariantViolation("x".into()).status_code(), 500);
    }

    #[test]
    fn test_chain_error_classification() {
        let io = ChainError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(RelayError::from(io).is_retryable());

        let invalid = ChainError::InvalidBlock {
            index: 3,
            reason: "hash mismatch".into(),
        };
        let mapped = RelayError::from(invalid);
        assert!(!mapped.is_retryable());
        assert_eq!(mapped.status_code(), 500);
    }
}
