//! Queue driver contract and the connection facade.
//!
//! A [`QueueDriver`] owns physical storage and the reservation transition for
//! one backend. A [`Connection`] binds a driver to its connection name, the
//! command registry, the event dispatcher and the clock, and is what
//! producers and the worker talk to.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use forgequeue_core::{
    Command, CommandRegistry, Delay, JobId, Payload, QueueResult, SharedClock,
};
use forgequeue_events::QueueEvents;

use crate::jobs::{JobRecord, ReservedJob, failing};

pub mod database;
pub mod managed;
pub mod memory;
pub mod null;
#[cfg(feature = "redis")]
pub mod redis;
pub mod sync;

pub use database::DatabaseQueue;
pub use managed::ManagedQueue;
pub use memory::{MemoryQueue, QueueStats};
pub use null::NullQueue;
#[cfg(feature = "redis")]
pub use self::redis::RedisQueue;
pub use sync::SyncQueue;

/// Options accepted by [`QueueDriver::push_raw`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOptions {
    /// Keep the job invisible to `pop` until the delay has passed.
    pub delay: Option<Delay>,
}

impl PushOptions {
    pub fn delayed(delay: impl Into<Delay>) -> Self {
        Self {
            delay: Some(delay.into()),
        }
    }
}

/// Backend-specific storage and reservation.
///
/// `pop` must be safe under concurrent callers: two concurrent calls against
/// the same backend never both receive the same logical job.
#[async_trait]
pub trait QueueDriver: Send + Sync + core::fmt::Debug {
    /// Driver kind as named in configuration.
    fn kind(&self) -> &'static str;

    fn default_queue(&self) -> &str;

    /// Drivers that run jobs inside `push` instead of storing them.
    fn executes_immediately(&self) -> bool {
        false
    }

    /// Hook to stamp driver bookkeeping (correlation id, attempts) into a
    /// payload before it is encoded.
    fn prepare_payload(&self, _payload: &mut Payload) {}

    async fn push_raw(&self, payload: String, queue: &str, options: PushOptions) -> QueueResult<JobId>;

    /// Push several payloads; drivers that can batch override this.
    async fn bulk_raw(&self, payloads: Vec<String>, queue: &str) -> QueueResult<Vec<JobId>> {
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            ids.push(self.push_raw(payload, queue, PushOptions::default()).await?);
        }
        Ok(ids)
    }

    /// Reserve at most one ready job.
    async fn pop(&self, queue: &str) -> QueueResult<Option<JobRecord>>;

    /// Permanently remove a reserved job.
    async fn delete_reserved(&self, queue: &str, job: &JobRecord) -> QueueResult<()>;

    /// Make a reserved job available again after `delay`, keeping its attempts.
    async fn release(&self, queue: &str, job: &JobRecord, delay: Delay) -> QueueResult<()>;

    /// Ready + delayed + reserved jobs on `queue`.
    async fn size(&self, queue: &str) -> QueueResult<u64>;
}

struct ConnectionInner {
    name: String,
    driver: Arc<dyn QueueDriver>,
    registry: Arc<CommandRegistry>,
    events: Arc<QueueEvents>,
    clock: SharedClock,
}

/// A named, driver-backed queue connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(
        name: impl Into<String>,
        driver: Arc<dyn QueueDriver>,
        registry: Arc<CommandRegistry>,
        events: Arc<QueueEvents>,
        clock: SharedClock,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                name: name.into(),
                driver,
                registry,
                events,
                clock,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn driver(&self) -> &Arc<dyn QueueDriver> {
        &self.inner.driver
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.inner.registry
    }

    pub fn events(&self) -> &Arc<QueueEvents> {
        &self.inner.events
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    /// The given queue, or the driver's default.
    pub fn queue_name<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.unwrap_or_else(|| self.inner.driver.default_queue())
    }

    /// Push a typed command.
    pub async fn push<C: Command>(&self, command: &C, queue: Option<&str>) -> QueueResult<JobId> {
        let payload = self.create_payload(Payload::for_command(command)?)?;
        self.push_raw(payload, queue, PushOptions::default()).await
    }

    /// Push raw arguments for a string-keyed handler.
    pub async fn push_handler(
        &self,
        job: &str,
        data: JsonValue,
        queue: Option<&str>,
    ) -> QueueResult<JobId> {
        let payload = self.create_payload(Payload::raw(job, data))?;
        self.push_raw(payload, queue, PushOptions::default()).await
    }

    /// Push a typed command that stays invisible until `delay` has passed.
    pub async fn later<C: Command>(
        &self,
        delay: impl Into<Delay>,
        command: &C,
        queue: Option<&str>,
    ) -> QueueResult<JobId> {
        let payload = self.create_payload(Payload::for_command(command)?)?;
        self.push_raw(payload, queue, PushOptions::delayed(delay))
            .await
    }

    /// Push several commands as one batch.
    pub async fn bulk<C: Command>(&self, commands: &[C], queue: Option<&str>) -> QueueResult<Vec<JobId>> {
        let payloads = commands
            .iter()
            .map(|command| self.create_payload(Payload::for_command(command)?))
            .collect::<QueueResult<Vec<_>>>()?;

        if self.inner.driver.executes_immediately() {
            let mut ids = Vec::with_capacity(payloads.len());
            for payload in payloads {
                ids.push(self.push_raw(payload, queue, PushOptions::default()).await?);
            }
            return Ok(ids);
        }

        let queue = self.queue_name(queue);
        self.inner.driver.bulk_raw(payloads, queue).await
    }

    /// Push an already-encoded payload.
    pub async fn push_raw(
        &self,
        payload: String,
        queue: Option<&str>,
        options: PushOptions,
    ) -> QueueResult<JobId> {
        let queue = self.queue_name(queue);

        if self.inner.driver.executes_immediately() {
            return sync::execute(self, payload, queue).await;
        }

        self.inner.driver.push_raw(payload, queue, options).await
    }

    /// Push a pre-built envelope (runs the driver's payload hook first).
    pub async fn push_payload(
        &self,
        payload: Payload,
        queue: Option<&str>,
        options: PushOptions,
    ) -> QueueResult<JobId> {
        let payload = self.create_payload(payload)?;
        self.push_raw(payload, queue, options).await
    }

    /// Reserve the next ready job.
    ///
    /// A reserved record whose payload cannot be decoded is failed and
    /// removed, and the decode error is returned.
    pub async fn pop(&self, queue: Option<&str>) -> QueueResult<Option<ReservedJob>> {
        let queue = self.queue_name(queue);

        let Some(record) = self.inner.driver.pop(queue).await? else {
            return Ok(None);
        };

        match Payload::decode(&record.raw_payload) {
            Ok(payload) => Ok(Some(ReservedJob::from_parts(self.clone(), record, payload))),
            Err(err) => Err(failing::fail_undecodable(self, &record, err).await),
        }
    }

    pub async fn size(&self, queue: Option<&str>) -> QueueResult<u64> {
        let queue = self.queue_name(queue);
        self.inner.driver.size(queue).await
    }

    fn create_payload(&self, mut payload: Payload) -> QueueResult<String> {
        self.inner.driver.prepare_payload(&mut payload);
        payload.encode()
    }
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("driver", &self.inner.driver.kind())
            .finish()
    }
}
