//! Loader error taxonomy
//!
//! Storage failures are split into transient ones (connectivity, timeouts,
//! serialization conflicts) and everything else so callers can pick a retry
//! policy. Nothing in this crate retries a mutating statement on its own.

use bundle_common::BundleError;
use thiserror::Error;

/// Result type alias for loader operations
pub type LoaderResult<T> = std::result::Result<T, LoaderError>;

#[derive(Error, Debug)]
pub enum LoaderError {
    /// Connectivity or timeout failure; the statement may succeed if re-issued
    #[error("Transient storage error: {0}")]
    Transient(#[source] sqlx::Error),

    /// Any other storage failure
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    /// A state the engine relies on does not hold (missing sequence value,
    /// unknown work item, unknown bundle type in storage)
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Bundle(#[from] BundleError),
}

impl LoaderError {
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether re-issuing the failed operation could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, LoaderError::Transient(_))
    }
}

/// Driver-level classification shared by every dialect. Dialects refine it
/// with vendor error codes.
pub fn classify_driver_error(err: sqlx::Error) -> LoaderError {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => LoaderError::Transient(err),
        other => LoaderError::Database(other),
    }
}

impl From<sqlx::Error> for LoaderError {
    fn from(err: sqlx::Error) -> Self {
        classify_driver_error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = LoaderError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
    }

    #[test]
    fn test_row_not_found_is_not_transient() {
        let err = LoaderError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, LoaderError::Database(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_invariant_message() {
        let err = LoaderError::invariant("sequence allocation_seq returned no value");
        assert_eq!(
            err.to_string(),
            "Invariant violated: sequence allocation_seq returned no value"
        );
    }
}
