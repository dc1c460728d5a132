//! Typed command registry.
//!
//! A payload never carries executable code. It carries a stable command name
//! plus an opaque JSON body; the worker looks the name up here and gets back
//! something it can run.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::clock::Delay;
use crate::error::{QueueError, QueueResult};
use crate::id::JobId;
use crate::payload::{CALL_QUEUED_HANDLER, Payload, PayloadData};

/// Queue interaction available to a running job body.
///
/// The worker hands the reserved job to `handle` through this interface so a
/// body can inspect its attempt count, delete itself, release itself back
/// with a delay, or fail itself outright.
#[async_trait]
pub trait QueueAwareJob: Send {
    fn job_id(&self) -> &JobId;

    fn queue(&self) -> &str;

    /// Number of times this job has been reserved, including the current one.
    fn attempts(&self) -> u32;

    async fn delete(&mut self) -> QueueResult<()>;

    async fn release(&mut self, delay: Delay) -> QueueResult<()>;

    /// Route the job through the failure pipeline.
    async fn fail(&mut self, error: Option<QueueError>) -> QueueResult<()>;
}

/// A self-contained unit of work that can be pushed onto a queue.
#[async_trait]
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable wire name; must not change once jobs are in flight.
    const NAME: &'static str;

    fn display_name(&self) -> String {
        Self::NAME.to_string()
    }

    /// Per-job override of the worker's max tries.
    fn max_tries(&self) -> Option<u32> {
        None
    }

    /// Per-job override of the worker's timeout, in seconds.
    fn timeout(&self) -> Option<u64> {
        None
    }

    async fn handle(&self, job: &mut dyn QueueAwareJob) -> anyhow::Result<()>;

    /// Called once when the job is moved to the failed archive.
    async fn failed(&self, _error: &QueueError) {}
}

/// Handler for string-keyed payloads carrying raw arguments.
#[async_trait]
pub trait RawHandler: Send + Sync {
    async fn handle(&self, data: &JsonValue, job: &mut dyn QueueAwareJob) -> anyhow::Result<()>;

    async fn failed(&self, _data: &JsonValue, _error: &QueueError) {}
}

#[async_trait]
trait DynCommand: Send + Sync {
    async fn handle(&self, job: &mut dyn QueueAwareJob) -> anyhow::Result<()>;

    async fn failed(&self, error: &QueueError);
}

#[async_trait]
impl<C: Command> DynCommand for C {
    async fn handle(&self, job: &mut dyn QueueAwareJob) -> anyhow::Result<()> {
        Command::handle(self, job).await
    }

    async fn failed(&self, error: &QueueError) {
        Command::failed(self, error).await
    }
}

type Decoder = Box<dyn Fn(JsonValue) -> QueueResult<Box<dyn DynCommand>> + Send + Sync>;

/// Name → deserializer table for commands and raw handlers.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Decoder>,
    handlers: HashMap<String, Arc<dyn RawHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command type under its `NAME`.
    pub fn register<C: Command>(&mut self) -> &mut Self {
        let decoder: Decoder = Box::new(|body| {
            let command: C = serde_json::from_value(body).map_err(|e| {
                QueueError::serialization(format!("unable to decode command {}: {e}", C::NAME))
            })?;
            Ok(Box::new(command) as Box<dyn DynCommand>)
        });
        self.commands.insert(C::NAME.to_string(), decoder);
        self
    }

    pub fn with<C: Command>(mut self) -> Self {
        self.register::<C>();
        self
    }

    /// Register a handler for raw payloads whose `job` field equals `name`.
    pub fn register_handler(
        &mut self,
        name: impl Into<String>,
        handler: impl RawHandler + 'static,
    ) -> &mut Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn with_handler(mut self, name: impl Into<String>, handler: impl RawHandler + 'static) -> Self {
        self.register_handler(name, handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name) || self.handlers.contains_key(name)
    }

    /// Turn a decoded payload into something runnable.
    pub fn resolve(&self, payload: &Payload) -> QueueResult<ResolvedJob> {
        if payload.job == CALL_QUEUED_HANDLER {
            let PayloadData::Command {
                command_name,
                command,
            } = &payload.data
            else {
                return Err(QueueError::serialization(
                    "command payload is missing commandName/command",
                ));
            };

            let decode = self
                .commands
                .get(command_name)
                .ok_or_else(|| QueueError::UnknownCommand(command_name.clone()))?;

            return Ok(ResolvedJob {
                inner: Resolved::Command(decode(command.clone())?),
            });
        }

        let handler = self
            .handlers
            .get(&payload.job)
            .cloned()
            .ok_or_else(|| QueueError::UnknownCommand(payload.job.clone()))?;

        let data = match &payload.data {
            PayloadData::Raw(value) => value.clone(),
            other => serde_json::to_value(other)?,
        };

        Ok(ResolvedJob {
            inner: Resolved::Raw { handler, data },
        })
    }
}

impl core::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

enum Resolved {
    Command(Box<dyn DynCommand>),
    Raw {
        handler: Arc<dyn RawHandler>,
        data: JsonValue,
    },
}

/// A payload bound to its command or handler, ready to run.
pub struct ResolvedJob {
    inner: Resolved,
}

impl ResolvedJob {
    pub async fn handle(&self, job: &mut dyn QueueAwareJob) -> anyhow::Result<()> {
        match &self.inner {
            Resolved::Command(command) => command.handle(job).await,
            Resolved::Raw { handler, data } => handler.handle(data, job).await,
        }
    }

    pub async fn failed(&self, error: &QueueError) {
        match &self.inner {
            Resolved::Command(command) => command.failed(error).await,
            Resolved::Raw { handler, data } => handler.failed(data, error).await,
        }
    }
}
