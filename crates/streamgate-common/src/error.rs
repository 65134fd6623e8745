//! Error types for streamgate services

use std::fmt;

/// Result type alias using StreamgateError
pub type Result<T> = std::result::Result<T, StreamgateError>;

/// Main error type for streamgate services
#[derive(Debug, thiserror::Error)]
pub enum StreamgateError {
    /// Invalid request/argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Query submission or execution failed inside the database
    #[error("Query execution failed: {0}")]
    QueryExecutionFailed(String),

    /// Query was cancelled before it finished
    #[error("Query was cancelled")]
    QueryCancelled,

    /// Database-level failure (open, connect, transaction)
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// File transfer (CSV import/export) failure
    #[error("Transfer error: {0}")]
    TransferError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StreamgateError {
    /// Create an internal error from any error type
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        StreamgateError::Internal(err.to_string())
    }

    /// Create a database error from any error type
    pub fn database<E: fmt::Display>(err: E) -> Self {
        StreamgateError::DatabaseError(err.to_string())
    }

    /// Create a query execution error from any error type
    pub fn query<E: fmt::Display>(err: E) -> Self {
        StreamgateError::QueryExecutionFailed(err.to_string())
    }

    /// Create a transfer error from any error type
    pub fn transfer<E: fmt::Display>(err: E) -> Self {
        StreamgateError::TransferError(err.to_string())
    }

    /// Get the error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            StreamgateError::InvalidArgument(_) => "INVALID_ARGUMENT",
            StreamgateError::QueryExecutionFailed(_) => "QUERY_FAILED",
            StreamgateError::QueryCancelled => "CANCELLED",
            StreamgateError::DatabaseError(_) => "DATABASE_ERROR",
            StreamgateError::ConfigError(_) => "CONFIG_ERROR",
            StreamgateError::TransferError(_) => "TRANSFER_FAILED",
            StreamgateError::SerializationError(_) => "SERIALIZATION_ERROR",
            StreamgateError::Internal(_) => "INTERNAL",
        }
    }

    /// The underlying cause, without the variant prefix
    pub fn detail(&self) -> String {
        match self {
            StreamgateError::InvalidArgument(msg)
            | StreamgateError::QueryExecutionFailed(msg)
            | StreamgateError::DatabaseError(msg)
            | StreamgateError::ConfigError(msg)
            | StreamgateError::TransferError(msg)
            | StreamgateError::SerializationError(msg)
            | StreamgateError::Internal(msg) => msg.clone(),
            StreamgateError::QueryCancelled => "query was cancelled".to_string(),
        }
    }

    /// Whether the error was caused by the caller rather than the service
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StreamgateError::InvalidArgument(_)
                | StreamgateError::QueryExecutionFailed(_)
                | StreamgateError::QueryCancelled
        )
    }
}

// Implement conversions from common error types
impl From<serde_json::Error> for StreamgateError {
    fn from(err: serde_json::Error) -> Self {
        StreamgateError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for StreamgateError {
    fn from(err: std::io::Error) -> Self {
        StreamgateError::Internal(format!("IO error: {}", err))
    }
}
