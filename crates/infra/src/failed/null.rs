use async_trait::async_trait;
use chrono::{DateTime, Utc};

use forgequeue_core::QueueResult;

use super::{FailedJob, FailedJobProvider};

/// Discards failures; use when the archive is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFailedJobProvider;

#[async_trait]
impl FailedJobProvider for NullFailedJobProvider {
    async fn log(
        &self,
        _connection: &str,
        _queue: &str,
        _payload: &str,
        _exception: &str,
        _failed_at: DateTime<Utc>,
    ) -> QueueResult<i64> {
        Ok(0)
    }

    async fn all(&self) -> QueueResult<Vec<FailedJob>> {
        Ok(Vec::new())
    }

    async fn find(&self, _id: i64) -> QueueResult<Option<FailedJob>> {
        Ok(None)
    }

    async fn forget(&self, _id: i64) -> QueueResult<bool> {
        Ok(false)
    }

    async fn flush(&self) -> QueueResult<()> {
        Ok(())
    }
}
