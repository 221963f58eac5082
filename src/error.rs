//! Error types for the pool engine.

use thiserror::Error;

/// Errors surfaced by the registry, ingestion, maintenance and lookup layers.
///
/// Validation failures are not represented here: a proxy that does not answer is
/// an expected outcome and is folded into its score instead.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The backing store could not be reached or rejected the operation.
    #[error("proxy store unavailable: {0}")]
    Store(#[from] sqlx::Error),

    /// No record matched the lookup, or the address is not in the pool.
    #[error("no proxy matches the request")]
    NotFound,

    /// A scraped candidate is missing its address or port.
    #[error("malformed candidate: {0}")]
    MalformedCandidate(String),

    /// A record that must never be persisted was handed to the registry.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A stored row could not be decoded into a record.
    #[error("corrupt stored record: {0}")]
    Corrupt(String),
}

impl PoolError {
    /// Whether the caller may retry the operation later.
    pub fn is_retriable(&self) -> bool {
        matches!(self, PoolError::Store(_))
    }
}

/// Result type for pool engine operations.
pub type PoolResult<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_errors_are_retriable() {
        assert!(PoolError::Store(sqlx::Error::PoolClosed).is_retriable());
        assert!(!PoolError::NotFound.is_retriable());
        assert!(!PoolError::MalformedCandidate("no port".into()).is_retriable());
        assert!(!PoolError::InvalidRecord("score 0".into()).is_retriable());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(PoolError::NotFound.to_string(), "no proxy matches the request");
        assert_eq!(
            PoolError::MalformedCandidate("empty address".into()).to_string(),
            "malformed candidate: empty address"
        );
    }
}
