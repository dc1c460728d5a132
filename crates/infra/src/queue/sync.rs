//! Driver that runs jobs inline inside `push`.

use async_trait::async_trait;
use tracing::error;

use forgequeue_core::{Delay, JobId, QueueResult};
use forgequeue_events::QueueEvent;

use crate::jobs::{JobRecord, ReservedJob};
use crate::queue::{Connection, PushOptions, QueueDriver};

/// Nothing is stored, so `pop` is always empty and `size` always zero.
#[derive(Debug, Clone)]
pub struct SyncQueue {
    default_queue: String,
}

impl SyncQueue {
    pub fn new(default_queue: impl Into<String>) -> Self {
        Self {
            default_queue: default_queue.into(),
        }
    }
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_QUEUE)
    }
}

#[async_trait]
impl QueueDriver for SyncQueue {
    fn kind(&self) -> &'static str {
        "sync"
    }

    fn default_queue(&self) -> &str {
        &self.default_queue
    }

    fn executes_immediately(&self) -> bool {
        true
    }

    async fn push_raw(&self, _payload: String, _queue: &str, _options: PushOptions) -> QueueResult<JobId> {
        // Connection::push_raw routes around this for immediate drivers.
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

/// Run a payload to completion on the caller's task.
///
/// Emits the same processing events as the worker. A failing body is sent
/// through the failure pipeline and its error is returned to the producer.
pub(crate) async fn execute(connection: &Connection, payload: String, queue: &str) -> QueueResult<JobId> {
    let id = JobId::random();
    let record = JobRecord::new(id.clone(), queue, payload, 1);
    let mut job = ReservedJob::new(connection.clone(), record)?;
    let events = connection.events().clone();

    events
        .dispatch(QueueEvent::JobProcessing {
            connection: connection.name().to_string(),
            job: job.snapshot(),
        })
        .await;

    match job.fire().await {
        Ok(()) => {
            events
                .dispatch(QueueEvent::JobProcessed {
                    connection: connection.name().to_string(),
                    job: job.snapshot(),
                })
                .await;
            Ok(id)
        }
        Err(err) => {
            events
                .dispatch(QueueEvent::JobExceptionOccurred {
                    connection: connection.name().to_string(),
                    job: job.snapshot(),
                    error: err.clone(),
                })
                .await;

            if let Err(fail_err) = job.fail(Some(err.clone())).await {
                error!(job_id = %id, error = %fail_err, "unable to fail sync job");
            }

            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use forgequeue_core::{CommandRegistry, QueueAwareJob, QueueError, RawHandler, SystemClock};
    use forgequeue_events::{QueueEvents, Subscription};
    use serde_json::{Value as JsonValue, json};

    struct Tally(Arc<AtomicU32>);

    #[async_trait]
    impl RawHandler for Tally {
        async fn handle(&self, data: &JsonValue, _job: &mut dyn QueueAwareJob) -> anyhow::Result<()> {
            if data["explode"].as_bool().unwrap_or(false) {
                anyhow::bail!("boom");
            }
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn connection(hits: Arc<AtomicU32>) -> (Connection, Subscription<QueueEvent>) {
        let events = QueueEvents::shared();
        let sub = events.subscribe();
        let registry = CommandRegistry::new().with_handler("tally", Tally(hits));
        let connection = Connection::new(
            "sync",
            Arc::new(SyncQueue::default()),
            Arc::new(registry),
            events,
            SystemClock::shared(),
        );
        (connection, sub)
    }

    #[tokio::test]
    async fn push_runs_the_job_before_returning() {
        let hits = Arc::new(AtomicU32::new(0));
        let (connection, sub) = connection(hits.clone());

        connection.push_handler("tally", json!({}), None).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(connection.size(None).await.unwrap(), 0);
        assert!(connection.pop(None).await.unwrap().is_none());

        let names: Vec<_> = sub.drain().iter().map(QueueEvent::name).collect();
        assert_eq!(names, vec!["job.processing", "job.processed"]);
    }

    #[tokio::test]
    async fn failing_body_is_failed_and_reraised() {
        let hits = Arc::new(AtomicU32::new(0));
        let (connection, sub) = connection(hits);

        let err = connection
            .push_handler("tally", json!({"explode": true}), None)
            .await
            .unwrap_err();

        assert_eq!(err, QueueError::Execution("boom".to_string()));

        let names: Vec<_> = sub.drain().iter().map(QueueEvent::name).collect();
        assert_eq!(
            names,
            vec!["job.processing", "job.exception_occurred", "job.failed"]
        );
    }
}
