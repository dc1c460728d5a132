//! Serialized job envelope.
//!
//! Every driver stores exactly this JSON document, so the worker layer never
//! depends on which backend reserved the job.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::command::Command;
use crate::error::{QueueError, QueueResult};

/// Execution entry point stored in `job` for command payloads.
pub const CALL_QUEUED_HANDLER: &str = "forgequeue.call_queued_handler";

/// The payload envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    /// Correlation id (set by drivers that key bookkeeping on it).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub display_name: String,
    pub job: String,
    #[serde(default)]
    pub max_tries: Option<u32>,
    #[serde(default)]
    pub timeout: Option<u64>,
    pub data: PayloadData,
    /// Attempt counter carried inside the payload (broker and managed drivers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

/// Either a typed command or raw arguments for a named handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadData {
    Command {
        #[serde(rename = "commandName")]
        command_name: String,
        command: JsonValue,
    },
    Raw(JsonValue),
}

impl Payload {
    /// Build the envelope for a typed command.
    pub fn for_command<C: Command>(command: &C) -> QueueResult<Self> {
        let body = serde_json::to_value(command)?;
        Ok(Self {
            id: None,
            display_name: command.display_name(),
            job: CALL_QUEUED_HANDLER.to_string(),
            max_tries: command.max_tries(),
            timeout: command.timeout(),
            data: PayloadData::Command {
                command_name: C::NAME.to_string(),
                command: body,
            },
            attempts: None,
        })
    }

    /// Build the envelope for a string-keyed handler with raw arguments.
    pub fn raw(job: impl Into<String>, data: JsonValue) -> Self {
        let job = job.into();
        Self {
            id: None,
            display_name: job.clone(),
            job,
            max_tries: None,
            timeout: None,
            data: PayloadData::Raw(data),
            attempts: None,
        }
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Name the registry resolves this payload by.
    pub fn command_name(&self) -> &str {
        match &self.data {
            PayloadData::Command { command_name, .. } if self.job == CALL_QUEUED_HANDLER => {
                command_name
            }
            _ => &self.job,
        }
    }

    pub fn encode(&self) -> QueueResult<String> {
        serde_json::to_string(self)
            .map_err(|e| QueueError::serialization(format!("unable to encode payload: {e}")))
    }

    pub fn decode(raw: &str) -> QueueResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| QueueError::serialization(format!("unable to decode payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_payload_uses_handler_name_as_job_and_display_name() {
        let payload = Payload::raw("mail.send", json!({"to": "ops@example.com"}));

        assert_eq!(payload.job, "mail.send");
        assert_eq!(payload.display_name, "mail.send");
        assert_eq!(payload.command_name(), "mail.send");
    }

    #[test]
    fn encoded_payload_carries_null_overrides_and_camel_case_keys() {
        let payload = Payload::raw("report", json!([1, 2]));
        let encoded: JsonValue = serde_json::from_str(&payload.encode().unwrap()).unwrap();

        assert_eq!(encoded["displayName"], "report");
        assert!(encoded["maxTries"].is_null());
        assert!(encoded["timeout"].is_null());
        assert!(encoded.get("id").is_none());
        assert!(encoded.get("attempts").is_none());
    }

    #[test]
    fn command_data_is_recognised_on_decode() {
        let raw = r#"{
            "displayName": "SendInvoice",
            "job": "forgequeue.call_queued_handler",
            "maxTries": 3,
            "timeout": null,
            "data": {"commandName": "invoices.send", "command": {"invoice": 7}}
        }"#;

        let payload = Payload::decode(raw).unwrap();

        assert_eq!(payload.max_tries, Some(3));
        assert_eq!(payload.command_name(), "invoices.send");
        assert!(matches!(payload.data, PayloadData::Command { .. }));
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        let err = Payload::decode("not json").unwrap_err();
        assert!(matches!(err, QueueError::Serialization(_)));
    }
}
