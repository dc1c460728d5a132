use thiserror::Error;

use forgequeue_core::QueueError;

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors raised by the worker process itself, as opposed to job failures.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to install signal handler: {0}")]
    Signal(String),
}
