//! In-process stand-in for a managed queue service.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use forgequeue_core::{QueueError, QueueResult, SharedClock};

use super::{RemoteMessage, RemoteQueueClient};

#[derive(Debug, Clone)]
struct Message {
    message_id: String,
    body: String,
    receive_count: u32,
    visible_at: i64,
    receipt_handle: Option<String>,
}

/// Emulates visibility timeouts and receive counts, keyed by queue URL.
#[derive(Debug)]
pub struct InMemoryRemoteQueue {
    visibility_timeout: u64,
    clock: SharedClock,
    queues: Mutex<HashMap<String, Vec<Message>>>,
}

impl InMemoryRemoteQueue {
    pub fn new(visibility_timeout: u64, clock: SharedClock) -> Self {
        Self {
            visibility_timeout,
            clock,
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> QueueResult<MutexGuard<'_, HashMap<String, Vec<Message>>>> {
        self.queues
            .lock()
            .map_err(|_| QueueError::backend("managed", "remote queue lock poisoned"))
    }
}

#[async_trait]
impl RemoteQueueClient for InMemoryRemoteQueue {
    async fn send_message(&self, queue_url: &str, body: &str, delay_seconds: u64) -> QueueResult<String> {
        let message_id = Uuid::new_v4().to_string();
        let visible_at = self.clock.timestamp() + delay_seconds as i64;

        self.lock()?
            .entry(queue_url.to_string())
            .or_default()
            .push(Message {
                message_id: message_id.clone(),
                body: body.to_string(),
                receive_count: 0,
                visible_at,
                receipt_handle: None,
            });

        Ok(message_id)
    }

    async fn receive_message(&self, queue_url: &str) -> QueueResult<Option<RemoteMessage>> {
        let now = self.clock.timestamp();
        let mut queues = self.lock()?;

        let Some(message) = queues
            .get_mut(queue_url)
            .and_then(|messages| messages.iter_mut().find(|m| m.visible_at <= now))
        else {
            return Ok(None);
        };

        let receipt_handle = Uuid::new_v4().to_string();
        message.receive_count += 1;
        message.visible_at = now + self.visibility_timeout as i64;
        message.receipt_handle = Some(receipt_handle.clone());

        Ok(Some(RemoteMessage {
            message_id: message.message_id.clone(),
            receipt_handle,
            body: message.body.clone(),
            receive_count: message.receive_count,
        }))
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> QueueResult<()> {
        if let Some(messages) = self.lock()?.get_mut(queue_url) {
            messages.retain(|m| m.receipt_handle.as_deref() != Some(receipt_handle));
        }
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout_seconds: u64,
    ) -> QueueResult<()> {
        let visible_at = self.clock.timestamp() + timeout_seconds as i64;
        let mut queues = self.lock()?;

        let message = queues.get_mut(queue_url).and_then(|messages| {
            messages
                .iter_mut()
                .find(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
        });

        match message {
            Some(message) => {
                message.visible_at = visible_at;
                Ok(())
            }
            None => Err(QueueError::backend(
                "managed",
                format!("receipt handle {receipt_handle} is not valid"),
            )),
        }
    }

    async fn approximate_count(&self, queue_url: &str) -> QueueResult<u64> {
        Ok(self
            .lock()?
            .get(queue_url)
            .map(|messages| messages.len() as u64)
            .unwrap_or(0))
    }
}
