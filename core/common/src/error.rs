//! Common error types for fitsync.

use thiserror::Error;

/// Top-level error type for fitsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Conflict detected.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Request did not complete (connection refused, DNS, reset, ...).
    #[error("Network error: {0}")]
    Network(String),

    /// Request exceeded the transport timeout.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Remote store answered with a non-success application-level response.
    #[error("Remote error ({status}): {message}")]
    Remote {
        /// HTTP-equivalent status code.
        status: u16,
        /// Message extracted from the response body.
        message: String,
    },

    /// Outbound change set is structurally malformed.
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

/// Coarse classification used to decide how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Transport failure or timeout; retried by the next natural trigger.
    Network,
    /// Malformed outbound data; never transmitted.
    Validation,
    /// Remote store rejected the request.
    Application,
    /// Local store failure.
    Database,
    /// Duplicate natural key or similar.
    Conflict,
    /// Anything else.
    Unknown,
}

impl Error {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Network(_) | Error::Timeout(_) => ErrorCategory::Network,
            Error::Validation(_) => ErrorCategory::Validation,
            Error::Remote { .. } => ErrorCategory::Application,
            Error::Storage(_) | Error::Io(_) | Error::NotFound(_) | Error::AlreadyExists(_) => {
                ErrorCategory::Database
            }
            Error::Conflict(_) => ErrorCategory::Conflict,
            Error::Serialization(_) | Error::InvalidInput(_) => ErrorCategory::Unknown,
        }
    }

    /// Whether the request never reached a definitive answer from the remote.
    pub fn is_network(&self) -> bool {
        self.category() == ErrorCategory::Network
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
