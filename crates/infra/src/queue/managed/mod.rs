//! Managed cloud queue driver.
//!
//! The service owns visibility timeouts and reports how many times a message
//! has been received, which is the job's attempt count. Releasing a job only
//! changes its visibility, so the message id is stable across attempts.
//! Talking to the service is behind [`RemoteQueueClient`] so the driver can
//! run against the HTTP API or the in-process emulator.

use std::sync::Arc;

use async_trait::async_trait;

use forgequeue_core::{Delay, JobId, QueueError, QueueResult, SharedClock};

use crate::jobs::JobRecord;
use crate::queue::{PushOptions, QueueDriver};

#[cfg(feature = "managed")]
pub mod http;
pub mod memory;

#[cfg(feature = "managed")]
pub use http::HttpQueueClient;
pub use memory::InMemoryRemoteQueue;

const BACKEND: &str = "managed";

/// A message handed out by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub message_id: String,
    /// Handle for acknowledging this particular receipt.
    pub receipt_handle: String,
    pub body: String,
    /// Times the service has delivered this message, including this one.
    pub receive_count: u32,
}

/// Minimal surface of a managed queue service.
#[async_trait]
pub trait RemoteQueueClient: Send + Sync + core::fmt::Debug {
    /// Returns the service-assigned message id.
    async fn send_message(&self, queue_url: &str, body: &str, delay_seconds: u64) -> QueueResult<String>;

    /// Receive at most one visible message, hiding it for the visibility timeout.
    async fn receive_message(&self, queue_url: &str) -> QueueResult<Option<RemoteMessage>>;

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> QueueResult<()>;

    /// Hide a received message for `timeout_seconds` from now.
    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout_seconds: u64,
    ) -> QueueResult<()>;

    async fn approximate_count(&self, queue_url: &str) -> QueueResult<u64>;
}

#[derive(Debug, Clone)]
pub struct ManagedQueue {
    client: Arc<dyn RemoteQueueClient>,
    prefix: String,
    default_queue: String,
    clock: SharedClock,
}

impl ManagedQueue {
    pub fn new(
        client: Arc<dyn RemoteQueueClient>,
        prefix: impl Into<String>,
        default_queue: impl Into<String>,
        clock: SharedClock,
    ) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            default_queue: default_queue.into(),
            clock,
        }
    }

    /// Full queue URL: queue names that are already URLs are used as is.
    pub fn queue_url(&self, queue: &str) -> String {
        if queue.starts_with("http://") || queue.starts_with("https://") {
            queue.to_string()
        } else {
            format!("{}/{queue}", self.prefix.trim_end_matches('/'))
        }
    }

    fn receipt(job: &JobRecord) -> QueueResult<&str> {
        job.receipt
            .as_deref()
            .ok_or_else(|| QueueError::backend(BACKEND, "reserved job has no receipt handle"))
    }
}

#[async_trait]
impl QueueDriver for ManagedQueue {
    fn kind(&self) -> &'static str {
        "managed"
    }

    fn default_queue(&self) -> &str {
        &self.default_queue
    }

    async fn push_raw(&self, payload: String, queue: &str, options: PushOptions) -> QueueResult<JobId> {
        let delay = options
            .delay
            .map(|delay| delay.seconds_from(self.clock.now()))
            .unwrap_or(0);
        let message_id = self
            .client
            .send_message(&self.queue_url(queue), &payload, delay)
            .await?;
        Ok(JobId::from(message_id))
    }

    async fn pop(&self, queue: &str) -> QueueResult<Option<JobRecord>> {
        let Some(message) = self.client.receive_message(&self.queue_url(queue)).await? else {
            return Ok(None);
        };

        Ok(Some(
            JobRecord::new(message.message_id, queue, message.body, message.receive_count)
                .with_reserved_at(self.clock.timestamp())
                .with_receipt(message.receipt_handle),
        ))
    }

    async fn delete_reserved(&self, queue: &str, job: &JobRecord) -> QueueResult<()> {
        self.client
            .delete_message(&self.queue_url(queue), Self::receipt(job)?)
            .await
    }

    async fn release(&self, queue: &str, job: &JobRecord, delay: Delay) -> QueueResult<()> {
        self.client
            .change_visibility(
                &self.queue_url(queue),
                Self::receipt(job)?,
                delay.seconds_from(self.clock.now()),
            )
            .await
    }

    async fn size(&self, queue: &str) -> QueueResult<u64> {
        self.client.approximate_count(&self.queue_url(queue)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use forgequeue_core::{ManualClock, Payload};
    use serde_json::json;

    fn managed(clock: &ManualClock) -> ManagedQueue {
        let remote = Arc::new(InMemoryRemoteQueue::new(30, clock.shared()));
        ManagedQueue::new(remote, "https://queue.local/123/", "default", clock.shared())
    }

    fn payload() -> String {
        Payload::raw("job", json!({})).encode().unwrap()
    }

    #[test]
    fn queue_urls_are_prefixed_unless_absolute() {
        let queue = managed(&ManualClock::starting_now());

        assert_eq!(queue.queue_url("emails"), "https://queue.local/123/emails");
        assert_eq!(
            queue.queue_url("https://elsewhere/456/jobs"),
            "https://elsewhere/456/jobs"
        );
    }

    #[tokio::test]
    async fn received_message_counts_as_an_attempt() {
        let clock = ManualClock::starting_now();
        let queue = managed(&clock);

        let id = queue
            .push_raw(payload(), "default", PushOptions::default())
            .await
            .unwrap();

        let job = queue.pop("default").await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.attempts, 1);
        assert!(queue.pop("default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unacknowledged_message_reappears_after_visibility_timeout() {
        let clock = ManualClock::starting_now();
        let queue = managed(&clock);
        queue
            .push_raw(payload(), "default", PushOptions::default())
            .await
            .unwrap();

        queue.pop("default").await.unwrap().unwrap();
        clock.advance(Duration::from_secs(30));

        let again = queue.pop("default").await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn release_hides_the_same_message_until_the_delay_passes() {
        let clock = ManualClock::starting_now();
        let queue = managed(&clock);
        let id = queue
            .push_raw(payload(), "default", PushOptions::default())
            .await
            .unwrap();

        let job = queue.pop("default").await.unwrap().unwrap();
        queue.release("default", &job, Delay::Seconds(10)).await.unwrap();
        assert_eq!(queue.size("default").await.unwrap(), 1);
        assert!(queue.pop("default").await.unwrap().is_none());

        clock.advance(Duration::from_secs(10));
        let again = queue.pop("default").await.unwrap().unwrap();

        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn delete_acknowledges_the_message() {
        let clock = ManualClock::starting_now();
        let queue = managed(&clock);
        queue
            .push_raw(payload(), "default", PushOptions::default())
            .await
            .unwrap();

        let job = queue.pop("default").await.unwrap().unwrap();
        queue.delete_reserved("default", &job).await.unwrap();

        clock.advance(Duration::from_secs(300));
        assert!(queue.pop("default").await.unwrap().is_none());
        assert_eq!(queue.size("default").await.unwrap(), 0);
    }
}
