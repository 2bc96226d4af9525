use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error returned by a loader.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Failure of a single query fetch.
///
/// Cloneable so that every caller joined on a de-duplicated fetch receives the
/// same error value.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The loader returned an error (after retries were exhausted).
    #[error("loader failed: {0}")]
    Loader(Arc<dyn StdError + Send + Sync>),

    /// A fetch was attempted on a record with no loader bound.
    #[error("no loader configured for query {0}")]
    NoLoader(String),

    /// The fetch was superseded or explicitly cancelled.
    #[error("fetch was cancelled")]
    Cancelled,
}

impl QueryError {
    /// Wraps any loader error.
    pub fn loader<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        QueryError::Loader(Arc::from(err.into()))
    }

    /// Returns `true` for [`QueryError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled)
    }
}

/// Errors raised by the store's serialization and persistence paths.
///
/// These never alter query state; the store logs and skips them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend failed: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loader_error_keeps_message() {
        let err = QueryError::loader("connection refused");
        assert_eq!(err.to_string(), "loader failed: connection refused");
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_cloned_errors_share_source() {
        let err = QueryError::loader(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out",
        ));
        let cloned = err.clone();
        match (err, cloned) {
            (QueryError::Loader(a), QueryError::Loader(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => panic!("expected loader errors"),
        }
    }

    #[test]
    fn test_serialization_error_conversion() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: StoreError = json_err.into();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
