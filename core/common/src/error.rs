//! Common error types for couchsync.

use thiserror::Error;

/// Top-level error type for replication operations.
///
/// HTTP failures are classified once, in [`Error::from_status`], so the
/// pull loop can decide how to recover without looking at raw statuses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The server rejected the session (HTTP 401).
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Resource or database not found (HTTP 404).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The server failed to handle the request (HTTP 5xx).
    #[error("Server error {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Any other non-success HTTP status.
    #[error("HTTP error {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The request was cancelled by the client.
    #[error("Request aborted")]
    Aborted,

    /// Connection-level failure (DNS, refused, reset, timeout).
    #[error("Network error: {0}")]
    Network(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => Error::Unauthenticated(message),
            404 => Error::NotFound(message),
            500..=599 => Error::Server { status, message },
            _ => Error::Http { status, message },
        }
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Unauthenticated(_) => Some(401),
            Error::NotFound(_) => Some(404),
            Error::Server { status, .. } | Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
