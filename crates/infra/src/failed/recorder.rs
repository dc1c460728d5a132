use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use forgequeue_events::{Listener, QueueEvent};

use super::FailedJobProvider;

/// Archives every `JobFailed` event into a [`FailedJobProvider`].
#[derive(Debug, Clone)]
pub struct FailedJobRecorder {
    provider: Arc<dyn FailedJobProvider>,
}

impl FailedJobRecorder {
    pub fn new(provider: Arc<dyn FailedJobProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Listener<QueueEvent> for FailedJobRecorder {
    async fn handle(&self, event: &QueueEvent) {
        let QueueEvent::JobFailed {
            connection,
            job,
            error,
            failed_at,
        } = event
        else {
            return;
        };

        match self
            .provider
            .log(connection, &job.queue, &job.payload, &error.to_string(), *failed_at)
            .await
        {
            Ok(id) => info!(failed_id = id, job_id = %job.id, connection = %connection, "failed job archived"),
            Err(err) => error!(job_id = %job.id, error = %err, "unable to archive failed job"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use forgequeue_core::{JobId, QueueError};
    use forgequeue_events::{JobSnapshot, QueueEvents};

    use crate::failed::InMemoryFailedJobProvider;

    fn snapshot() -> JobSnapshot {
        JobSnapshot {
            id: JobId::from("7"),
            queue: "emails".to_string(),
            display_name: "SendMail".to_string(),
            attempts: 3,
            payload: "{\"job\":\"mail\"}".to_string(),
        }
    }

    #[tokio::test]
    async fn only_job_failed_events_are_archived() {
        let provider = Arc::new(InMemoryFailedJobProvider::new());
        let events = QueueEvents::new();
        events.listen(FailedJobRecorder::new(provider.clone()));

        events
            .dispatch(QueueEvent::JobProcessed {
                connection: "redis".to_string(),
                job: snapshot(),
            })
            .await;
        events
            .dispatch(QueueEvent::JobFailed {
                connection: "redis".to_string(),
                job: snapshot(),
                error: QueueError::Execution("smtp down".to_string()),
                failed_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            })
            .await;

        let archived = provider.all().await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].connection, "redis");
        assert_eq!(archived[0].queue, "emails");
        assert_eq!(archived[0].payload, "{\"job\":\"mail\"}");
        assert_eq!(archived[0].exception, "job execution failed: smtp down");
        assert_eq!(
            archived[0].failed_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
        );
    }
}
