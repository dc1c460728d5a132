//! Failed-job archive.
//!
//! Jobs that exhaust their attempts (or fail themselves) are recorded here
//! by [`FailedJobRecorder`], which listens for `JobFailed` events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use forgequeue_core::QueueResult;

pub mod database;
pub mod memory;
pub mod null;
pub mod recorder;

pub use database::DatabaseFailedJobProvider;
pub use memory::InMemoryFailedJobProvider;
pub use null::NullFailedJobProvider;
pub use recorder::FailedJobRecorder;

/// One archived failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedJob {
    pub id: i64,
    pub connection: String,
    pub queue: String,
    pub payload: String,
    pub exception: String,
    pub failed_at: DateTime<Utc>,
}

/// Storage for failed jobs.
#[async_trait]
pub trait FailedJobProvider: Send + Sync + core::fmt::Debug {
    /// Record a failure that happened at `failed_at` and return its id.
    async fn log(
        &self,
        connection: &str,
        queue: &str,
        payload: &str,
        exception: &str,
        failed_at: DateTime<Utc>,
    ) -> QueueResult<i64>;

    /// Every recorded failure, newest first.
    async fn all(&self) -> QueueResult<Vec<FailedJob>>;

    async fn find(&self, id: i64) -> QueueResult<Option<FailedJob>>;

    /// Remove one record; `false` if it did not exist.
    async fn forget(&self, id: i64) -> QueueResult<bool>;

    /// Remove every record.
    async fn flush(&self) -> QueueResult<()>;
}
