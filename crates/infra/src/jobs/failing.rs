//! The failure pipeline.

use tracing::warn;

use forgequeue_core::{QueueError, QueueResult};
use forgequeue_events::{JobSnapshot, QueueEvent};

use crate::jobs::record::JobRecord;
use crate::jobs::reserved::ReservedJob;
use crate::queue::Connection;

/// Display name for reserved records whose payload cannot be decoded.
const UNDECODABLE: &str = "undecodable payload";

/// Mark `job` failed, delete it, run its `failed` hook and announce
/// `JobFailed` on `connection_name`.
///
/// Runs at most once per job. The hook and the event fire even when the
/// delete fails; the delete error is returned afterwards.
pub async fn fail_job(
    connection_name: &str,
    job: &mut ReservedJob,
    error: Option<QueueError>,
) -> QueueResult<()> {
    if job.has_failed() {
        return Ok(());
    }

    job.mark_as_failed();

    let deleted = if job.is_deleted() {
        Ok(())
    } else {
        job.delete().await
    };

    let error = error.unwrap_or(QueueError::ManuallyFailed);

    job.failed_hook(&error).await;

    warn!(
        connection = connection_name,
        job_id = %job.id(),
        queue = job.queue(),
        attempts = job.attempts(),
        error = %error,
        "job failed"
    );

    let events = job.connection().events().clone();
    let failed_at = job.connection().clock().now();
    events
        .dispatch(QueueEvent::JobFailed {
            connection: connection_name.to_string(),
            job: job.snapshot(),
            error,
            failed_at,
        })
        .await;

    deleted
}

/// Fail a reserved record whose payload is not a valid envelope.
///
/// Such a record can never run, so it is deleted straight away and announced
/// with `JobFailed` carrying `error`; no `failed` hook exists to call.
/// Returns `error` for the caller to propagate.
pub(crate) async fn fail_undecodable(
    connection: &Connection,
    record: &JobRecord,
    error: QueueError,
) -> QueueError {
    if let Err(err) = connection
        .driver()
        .delete_reserved(&record.queue, record)
        .await
    {
        warn!(job_id = %record.id, error = %err, "unable to delete undecodable job");
    }

    warn!(
        connection = connection.name(),
        job_id = %record.id,
        queue = %record.queue,
        attempts = record.attempts,
        error = %error,
        "job payload cannot be decoded; job failed"
    );

    connection
        .events()
        .dispatch(QueueEvent::JobFailed {
            connection: connection.name().to_string(),
            job: JobSnapshot {
                id: record.id.clone(),
                queue: record.queue.clone(),
                display_name: UNDECODABLE.to_string(),
                attempts: record.attempts,
                payload: record.raw_payload.clone(),
            },
            error: error.clone(),
            failed_at: connection.clock().now(),
        })
        .await;

    error
}
