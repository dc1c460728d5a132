use async_trait::async_trait;

use forgequeue_core::{Delay, JobId, QueueResult};

use crate::jobs::JobRecord;
use crate::queue::{PushOptions, QueueDriver};

/// Driver that accepts and discards every push.
#[derive(Debug, Clone)]
pub struct NullQueue {
    default_queue: String,
}

impl NullQueue {
    pub fn new(default_queue: impl Into<String>) -> Self {
        Self {
            default_queue: default_queue.into(),
        }
    }
}

#[async_trait]
impl QueueDriver for NullQueue {
    fn kind(&self) -> &'static str {
        "null"
    }

    fn default_queue(&self) -> &str {
        &self.default_queue
    }

    async fn push_raw(&self, _payload: String, _queue: &str, _options: PushOptions) -> QueueResult<JobId> {
        Ok(JobId::random())
    }

    async fn pop(&self, _queue: &str) -> QueueResult<Option<JobRecord>> {
        Ok(None)
    }

    async fn delete_reserved(&self, _queue: &str, _job: &JobRecord) -> QueueResult<()> {
        Ok(())
    }

    async fn release(&self, _queue: &str, _job: &JobRecord, _delay: Delay) -> QueueResult<()> {
        Ok(())
    }

    async fn size(&self, _queue: &str) -> QueueResult<u64> {
        Ok(0)
    }
}
