//! Container engine client error types.

use thiserror::Error;

/// Result type for engine API calls.
pub type DockerResult<T> = Result<T, DockerError>;

/// Errors that can occur while talking to the container engine.
#[derive(Debug, Error)]
pub enum DockerError {
    /// The referenced container, exec instance, network or image does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The engine answered with a non-success status.
    #[error("engine {operation} failed with status {status}: {message}")]
    Api {
        operation: &'static str,
        status: u16,
        message: String,
    },

    /// The socket connection or the response body failed.
    #[error("engine {operation} transport error: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    /// A response body could not be decoded.
    #[error("failed to decode engine {operation} response: {source}")]
    Decode {
        operation: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl DockerError {
    /// Whether this error means the target object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DockerError::NotFound(_))
    }
}
