//! Error types for the PaperTrail ingestion core.

use thiserror::Error;

/// Result type alias using PaperTrail's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for PaperTrail operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Catalog item not found
    #[error("Catalog item not found: {0}")]
    ItemNotFound(String),

    /// Import task not found
    #[error("Import task not found: {0}")]
    TaskNotFound(uuid::Uuid),

    /// Embedding generation failed on every provider
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Inference/generation failed
    #[error("Inference error: {0}")]
    Inference(String),

    /// The item source (query, metadata or content fetch) failed
    #[error("Source error: {0}")]
    Source(String),

    /// The record store rejected or could not complete an operation
    #[error("Store error: {0}")]
    Store(String),

    /// An external call exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means the record store itself is unusable.
    ///
    /// Fatal errors end the affected worker loop instead of being recorded
    /// against a single item. A store call that merely missed its deadline
    /// is an [`Error::Timeout`] and is not fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Store(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

/// Outcome of a failed call to the analysis (LLM) gateway.
///
/// Callers must branch on the variant: only [`AnalysisError::Unavailable`]
/// is retried by the backfill worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    /// The provider could not be reached, timed out, returned an error, or
    /// its circuit breaker is open.
    #[error("Analysis provider unavailable: {0}")]
    Unavailable(String),

    /// The request itself cannot be analysed (for example, no usable text).
    #[error("Analysis input rejected: {0}")]
    InvalidInput(String),
}

impl AnalysisError {
    /// Whether retrying the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AnalysisError::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_error_display_item_not_found() {
        let err = Error::ItemNotFound("2401.00001".to_string());
        assert_eq!(err.to_string(), "Catalog item not found: 2401.00001");
    }

    #[test]
    fn test_error_display_task_not_found() {
        let id = Uuid::nil();
        let err = Error::TaskNotFound(id);
        assert_eq!(err.to_string(), format!("Import task not found: {}", id));
    }

    #[test]
    fn test_error_display_timeout() {
        let err = Error::Timeout("source query after 30s".to_string());
        assert_eq!(err.to_string(), "Timed out: source query after 30s");
    }

    #[test]
    fn test_error_display_source() {
        let err = Error::Source("HTTP 503".to_string());
        assert_eq!(err.to_string(), "Source error: HTTP 503");
    }

    #[test]
    fn test_store_errors_are_fatal() {
        assert!(Error::Store("connection refused".into()).is_fatal());
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_fatal());
    }

    #[test]
    fn test_item_level_errors_are_not_fatal() {
        assert!(!Error::Source("404".into()).is_fatal());
        assert!(!Error::Timeout("fetch".into()).is_fatal());
        assert!(!Error::Embedding("both providers failed".into()).is_fatal());
        assert!(!Error::InvalidInput("empty id".into()).is_fatal());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(err.to_string().contains("Serialization error:"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_analysis_error_retryable() {
        assert!(AnalysisError::Unavailable("breaker open".into()).is_retryable());
        assert!(!AnalysisError::InvalidInput("no text".into()).is_retryable());
    }

    #[test]
    fn test_analysis_error_display() {
        let err = AnalysisError::InvalidInput("no usable text".into());
        assert_eq!(err.to_string(), "Analysis input rejected: no usable text");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
        assert_send::<AnalysisError>();
        assert_sync::<AnalysisError>();
    }
}
