//! HTTP client for SQS-compatible services speaking the JSON 1.0 protocol.
//!
//! Requests are unsigned: point `endpoint` at an emulator (ElasticMQ,
//! LocalStack) or a signing proxy.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value as JsonValue, json};
use tracing::debug;

use forgequeue_core::{QueueError, QueueResult};

use super::{RemoteMessage, RemoteQueueClient};

const BACKEND: &str = "managed";
const TARGET_PREFIX: &str = "AmazonSQS";
const CONTENT_TYPE_JSON: &str = "application/x-amz-json-1.0";

#[derive(Debug, Clone)]
pub struct HttpQueueClient {
    http: reqwest::Client,
    endpoint: String,
    wait_time_seconds: u64,
}

impl HttpQueueClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            wait_time_seconds: 0,
        }
    }

    /// Long-poll for up to `seconds` when receiving.
    pub fn with_wait_time(mut self, seconds: u64) -> Self {
        self.wait_time_seconds = seconds.min(20);
        self
    }

    async fn call<T: DeserializeOwned>(&self, action: &str, body: JsonValue) -> QueueResult<T> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("X-Amz-Target", format!("{TARGET_PREFIX}.{action}"))
            .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| QueueError::backend(BACKEND, format!("{action}: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| QueueError::backend(BACKEND, format!("{action}: {e}")))?;

        if !status.is_success() {
            return Err(QueueError::backend(
                BACKEND,
                format!("{action} returned {status}: {text}"),
            ));
        }

        // Some actions answer with an empty body.
        let text = if text.trim().is_empty() { "{}" } else { text.as_str() };
        serde_json::from_str(text)
            .map_err(|e| QueueError::backend(BACKEND, format!("{action}: invalid response: {e}")))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendMessageResponse {
    message_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageResponse {
    #[serde(default)]
    messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceivedMessage {
    message_id: String,
    receipt_handle: String,
    body: String,
    #[serde(default)]
    attributes: ReceivedAttributes,
}

#[derive(Debug, Default, Deserialize)]
struct ReceivedAttributes {
    #[serde(rename = "ApproximateReceiveCount")]
    receive_count: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueueAttributesResponse {
    #[serde(default)]
    attributes: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Empty {}

#[async_trait]
impl RemoteQueueClient for HttpQueueClient {
    async fn send_message(&self, queue_url: &str, body: &str, delay_seconds: u64) -> QueueResult<String> {
        let response: SendMessageResponse = self
            .call(
                "SendMessage",
                json!({
                    "QueueUrl": queue_url,
                    "MessageBody": body,
                    "DelaySeconds": delay_seconds.min(900),
                }),
            )
            .await?;
        Ok(response.message_id)
    }

    async fn receive_message(&self, queue_url: &str) -> QueueResult<Option<RemoteMessage>> {
        let response: ReceiveMessageResponse = self
            .call(
                "ReceiveMessage",
                json!({
                    "QueueUrl": queue_url,
                    "MaxNumberOfMessages": 1,
                    "WaitTimeSeconds": self.wait_time_seconds,
                    "AttributeNames": ["ApproximateReceiveCount"],
                }),
            )
            .await?;

        let Some(message) = response.messages.into_iter().next() else {
            return Ok(None);
        };

        let receive_count: u32 = message
            .attributes
            .receive_count
            .as_deref()
            .and_then(|count| count.parse().ok())
            .unwrap_or(1);

        debug!(message_id = %message.message_id, receive_count, "received message");

        Ok(Some(RemoteMessage {
            message_id: message.message_id,
            receipt_handle: message.receipt_handle,
            body: message.body,
            receive_count,
        }))
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> QueueResult<()> {
        let _: Empty = self
            .call(
                "DeleteMessage",
                json!({ "QueueUrl": queue_url, "ReceiptHandle": receipt_handle }),
            )
            .await?;
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout_seconds: u64,
    ) -> QueueResult<()> {
        let _: Empty = self
            .call(
                "ChangeMessageVisibility",
                json!({
                    "QueueUrl": queue_url,
                    "ReceiptHandle": receipt_handle,
                    "VisibilityTimeout": timeout_seconds.min(43_200),
                }),
            )
            .await?;
        Ok(())
    }

    async fn approximate_count(&self, queue_url: &str) -> QueueResult<u64> {
        let response: QueueAttributesResponse = self
            .call(
                "GetQueueAttributes",
                json!({
                    "QueueUrl": queue_url,
                    "AttributeNames": ["ApproximateNumberOfMessages"],
                }),
            )
            .await?;

        Ok(response
            .attributes
            .get("ApproximateNumberOfMessages")
            .and_then(|count| count.parse().ok())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_response_reads_receive_count_attribute() {
        let raw = r#"{
            "Messages": [{
                "MessageId": "m-1",
                "ReceiptHandle": "r-1",
                "Body": "{}",
                "Attributes": {"ApproximateReceiveCount": "3"}
            }]
        }"#;

        let response: ReceiveMessageResponse = serde_json::from_str(raw).unwrap();
        let message = &response.messages[0];

        assert_eq!(message.receipt_handle, "r-1");
        assert_eq!(message.attributes.receive_count.as_deref(), Some("3"));
    }

    #[test]
    fn empty_receive_response_has_no_messages() {
        let response: ReceiveMessageResponse = serde_json::from_str("{}").unwrap();
        assert!(response.messages.is_empty());
    }
}
