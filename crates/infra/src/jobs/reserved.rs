//! A job reserved by a worker (or executed inline by the sync driver).

use async_trait::async_trait;
use tracing::{debug, warn};

use forgequeue_core::{Delay, JobId, Payload, QueueAwareJob, QueueError, QueueResult};
use forgequeue_events::JobSnapshot;

use crate::jobs::failing;
use crate::jobs::record::JobRecord;
use crate::queue::Connection;

/// A reserved job bound to the connection it came from.
///
/// The deleted / released / failed flags only ever go from false to true.
pub struct ReservedJob {
    connection: Connection,
    record: JobRecord,
    payload: Payload,
    deleted: bool,
    released: bool,
    failed: bool,
}

impl ReservedJob {
    /// Wrap a driver record; fails if the stored payload is not a valid envelope.
    pub fn new(connection: Connection, record: JobRecord) -> QueueResult<Self> {
        let payload = Payload::decode(&record.raw_payload)?;
        Ok(Self::from_parts(connection, record, payload))
    }

    pub(crate) fn from_parts(connection: Connection, record: JobRecord, payload: Payload) -> Self {
        Self {
            connection,
            record,
            payload,
            deleted: false,
            released: false,
            failed: false,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.record.id
    }

    pub fn queue(&self) -> &str {
        &self.record.queue
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn raw_body(&self) -> &str {
        &self.record.raw_payload
    }

    pub fn attempts(&self) -> u32 {
        self.record.attempts
    }

    pub fn max_tries(&self) -> Option<u32> {
        self.payload.max_tries
    }

    pub fn timeout(&self) -> Option<u64> {
        self.payload.timeout
    }

    pub fn display_name(&self) -> &str {
        &self.payload.display_name
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_name(&self) -> &str {
        self.connection.name()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn is_deleted_or_released(&self) -> bool {
        self.deleted || self.released
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub(crate) fn mark_as_failed(&mut self) {
        self.failed = true;
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.record.id.clone(),
            queue: self.record.queue.clone(),
            display_name: self.payload.display_name.clone(),
            attempts: self.record.attempts,
            payload: self.record.raw_payload.clone(),
        }
    }

    /// Resolve the payload and run its body.
    ///
    /// A body that returns normally without deleting or releasing the job has
    /// it deleted here.
    pub async fn fire(&mut self) -> QueueResult<()> {
        let resolved = self.connection.registry().resolve(&self.payload)?;

        resolved
            .handle(self)
            .await
            .map_err(QueueError::execution)?;

        if !self.is_deleted_or_released() {
            self.delete().await?;
        }

        Ok(())
    }

    /// Remove the job from the backend. Idempotent.
    pub async fn delete(&mut self) -> QueueResult<()> {
        if self.deleted {
            return Ok(());
        }

        let driver = self.connection.driver().clone();
        driver.delete_reserved(&self.record.queue, &self.record).await?;
        self.deleted = true;

        debug!(job_id = %self.record.id, queue = %self.record.queue, "job deleted");
        Ok(())
    }

    /// Hand the job back to the backend, visible again after `delay`.
    pub async fn release(&mut self, delay: Delay) -> QueueResult<()> {
        let driver = self.connection.driver().clone();
        driver.release(&self.record.queue, &self.record, delay).await?;
        self.released = true;

        debug!(
            job_id = %self.record.id,
            queue = %self.record.queue,
            attempts = self.record.attempts,
            "job released"
        );
        Ok(())
    }

    /// Route the job through the failure pipeline on its own connection.
    pub async fn fail(&mut self, error: Option<QueueError>) -> QueueResult<()> {
        let connection = self.connection.name().to_string();
        failing::fail_job(&connection, self, error).await
    }

    /// Run the command's `failed` hook. Resolution problems are logged, not raised.
    pub(crate) async fn failed_hook(&self, error: &QueueError) {
        match self.connection.registry().resolve(&self.payload) {
            Ok(resolved) => resolved.failed(error).await,
            Err(err) => warn!(
                job_id = %self.record.id,
                error = %err,
                "unable to resolve job for its failed hook"
            ),
        }
    }
}

#[async_trait]
impl QueueAwareJob for ReservedJob {
    fn job_id(&self) -> &JobId {
        &self.record.id
    }

    fn queue(&self) -> &str {
        &self.record.queue
    }

    fn attempts(&self) -> u32 {
        self.record.attempts
    }

    async fn delete(&mut self) -> QueueResult<()> {
        ReservedJob::delete(self).await
    }

    async fn release(&mut self, delay: Delay) -> QueueResult<()> {
        ReservedJob::release(self, delay).await
    }

    async fn fail(&mut self, error: Option<QueueError>) -> QueueResult<()> {
        ReservedJob::fail(self, error).await
    }
}

impl core::fmt::Debug for ReservedJob {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReservedJob")
            .field("connection", &self.connection.name())
            .field("record", &self.record)
            .field("deleted", &self.deleted)
            .field("released", &self.released)
            .field("failed", &self.failed)
            .finish()
    }
}
