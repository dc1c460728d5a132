//! Queue error model.

use thiserror::Error;

/// Result type used across the queue layers.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-level error.
///
/// Errors are `Clone` because the same failure is handed to lifecycle
/// listeners, the job's `failed` hook and the caller of the worker loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// A payload could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The job was reserved more times than its effective max tries allows.
    #[error("{display_name} has been attempted too many times or run too long; the job may have previously timed out")]
    MaxAttemptsExceeded { display_name: String },

    /// The job body returned an error.
    #[error("job execution failed: {0}")]
    Execution(String),

    /// The backing store rejected or failed an operation.
    #[error("{backend} backend error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    /// A connection name that has no configuration entry.
    #[error("queue connection [{0}] is not configured")]
    UnknownConnection(String),

    /// A configured driver kind with no registered connector.
    #[error("no connector registered for driver [{0}]")]
    UnsupportedDriver(String),

    /// A payload naming a command or handler the registry does not know.
    #[error("no command or handler registered under [{0}]")]
    UnknownCommand(String),

    /// Invalid or incomplete configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Marker used when a job is failed without an underlying error.
    #[error("job was manually failed")]
    ManuallyFailed,
}

/// Message fragments that indicate the backend connection is gone for good
/// and the worker should be restarted by its supervisor.
const LOST_CONNECTION_MARKERS: &[&str] = &[
    "server has gone away",
    "no connection to the server",
    "lost connection",
    "is dead or not enabled",
    "error while sending",
    "decryption failed or bad record mac",
    "server closed the connection unexpectedly",
    "ssl connection has been closed unexpectedly",
    "error writing data to the connection",
    "resource deadlock avoided",
    "connection refused",
    "broken pipe",
    "connection reset by peer",
    "pool closed",
];

impl QueueError {
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn backend(backend: &'static str, msg: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap a job body failure, keeping the full context chain.
    pub fn execution(err: anyhow::Error) -> Self {
        Self::Execution(format!("{err:#}"))
    }

    pub fn max_attempts_exceeded(display_name: impl Into<String>) -> Self {
        Self::MaxAttemptsExceeded {
            display_name: display_name.into(),
        }
    }

    /// Whether this error means the backend connection was lost.
    pub fn is_lost_connection(&self) -> bool {
        match self {
            QueueError::Backend { message, .. } => {
                let message = message.to_lowercase();
                LOST_CONNECTION_MARKERS
                    .iter()
                    .any(|marker| message.contains(marker))
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
