use chrono::{DateTime, Utc};
use serde::Serialize;

use forgequeue_core::{JobId, QueueError};

/// Point-in-time view of a reserved job, carried by lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub queue: String,
    pub display_name: String,
    pub attempts: u32,
    /// Raw payload exactly as stored by the driver.
    pub payload: String,
}

/// Queue lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A reserved job is about to run.
    JobProcessing { connection: String, job: JobSnapshot },

    /// A job body returned successfully.
    JobProcessed { connection: String, job: JobSnapshot },

    /// A job body (or the max-attempts guard) raised an error.
    JobExceptionOccurred {
        connection: String,
        job: JobSnapshot,
        error: QueueError,
    },

    /// A job was moved to the failed archive.
    JobFailed {
        connection: String,
        job: JobSnapshot,
        error: QueueError,
        failed_at: DateTime<Utc>,
    },

    /// The worker is about to start an iteration.
    Looping { connection: String, queue: String },

    /// The worker is exiting with the given status.
    WorkerStopping { status: i32 },
}

impl QueueEvent {
    /// Stable event name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::JobProcessing { .. } => "job.processing",
            QueueEvent::JobProcessed { .. } => "job.processed",
            QueueEvent::JobExceptionOccurred { .. } => "job.exception_occurred",
            QueueEvent::JobFailed { .. } => "job.failed",
            QueueEvent::Looping { .. } => "worker.looping",
            QueueEvent::WorkerStopping { .. } => "worker.stopping",
        }
    }

    pub fn job(&self) -> Option<&JobSnapshot> {
        match self {
            QueueEvent::JobProcessing { job, .. }
            | QueueEvent::JobProcessed { job, .. }
            | QueueEvent::JobExceptionOccurred { job, .. }
            | QueueEvent::JobFailed { job, .. } => Some(job),
            QueueEvent::Looping { .. } | QueueEvent::WorkerStopping { .. } => None,
        }
    }
}
