//! Orchestrator error types.

use thiserror::Error;

use crate::docker::DockerError;

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors surfaced by the room orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No container for the room, or the container is not running.
    #[error("container unavailable for '{target}': {reason}")]
    ContainerUnavailable { target: String, reason: String },

    /// The exec transport failed mid-command. Never retried here.
    #[error("exec stream failed: {0}")]
    ExecStreamError(String),

    /// The proxy could not be reloaded or restarted.
    #[error("proxy reload failed: {0}")]
    ProxyReloadFailed(String),

    /// One monitoring tick could not enumerate listening sockets.
    #[error("port discovery failed for room '{room}': {reason}")]
    PortDiscoveryFailed { room: String, reason: String },

    /// A create or rename targeted a path that already exists.
    #[error("path already exists: {0}")]
    PathConflict(String),

    /// An exit-code-checked command exited non-zero.
    #[error("command `{command}` exited with {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i64,
        stderr: String,
    },

    /// A path escapes the workspace root or is malformed.
    #[error("invalid path '{0}'")]
    InvalidPath(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// PTY spawn, write or resize failed.
    #[error("terminal error: {0}")]
    Terminal(String),

    #[error(transparent)]
    Docker(#[from] DockerError),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn unavailable(target: impl Into<String>, reason: impl Into<String>) -> Self {
        OrchestratorError::ContainerUnavailable {
            target: target.into(),
            reason: reason.into(),
        }
    }
}
