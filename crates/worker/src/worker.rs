//! The queue worker: reserve, run, acknowledge, repeat.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use forgequeue_core::{Delay, QueueError, QueueResult, WorkerOptions};
use forgequeue_events::{QueueEvent, QueueEvents};
use forgequeue_infra::{Connection, QueueManager, ReservedJob, fail_job};

use crate::error::WorkerResult;
use crate::probes::{
    InMemoryMaintenanceMode, InMemoryRestartSignal, MaintenanceMode, MemoryProbe,
    RestartSignal, RusageMemoryProbe,
};
use crate::signals::WorkerState;
use crate::watchdog::Watchdog;

/// Exit status used when the memory limit stops the daemon, so supervisors
/// can tell it apart from a normal stop.
pub const MEMORY_EXCEEDED_STATUS: i32 = 12;

/// Why the daemon loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Asked to quit, or the backend connection was lost.
    Quit,
    MemoryExceeded,
    /// The restart marker changed since the daemon started.
    Restart,
}

impl StopReason {
    pub fn exit_status(self) -> i32 {
        match self {
            StopReason::Quit | StopReason::Restart => 0,
            StopReason::MemoryExceeded => MEMORY_EXCEEDED_STATUS,
        }
    }
}

/// Returning `false` skips the current iteration, like a paused worker.
pub type LoopGuard = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

pub struct Worker {
    manager: Arc<QueueManager>,
    events: Arc<QueueEvents>,
    maintenance: Arc<dyn MaintenanceMode>,
    restart: Arc<dyn RestartSignal>,
    memory: Arc<dyn MemoryProbe>,
    state: WorkerState,
    watchdog: Watchdog,
    loop_guard: Option<LoopGuard>,
}

impl Worker {
    pub fn new(manager: Arc<QueueManager>, watchdog: Watchdog) -> Self {
        let events = manager.events().clone();
        Self {
            manager,
            events,
            maintenance: Arc::new(InMemoryMaintenanceMode::new()),
            restart: Arc::new(InMemoryRestartSignal::new()),
            memory: Arc::new(RusageMemoryProbe),
            state: WorkerState::new(),
            watchdog,
            loop_guard: None,
        }
    }

    pub fn with_maintenance(mut self, maintenance: Arc<dyn MaintenanceMode>) -> Self {
        self.maintenance = maintenance;
        self
    }

    pub fn with_restart_signal(mut self, restart: Arc<dyn RestartSignal>) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_memory_probe(mut self, memory: Arc<dyn MemoryProbe>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_state(mut self, state: WorkerState) -> Self {
        self.state = state;
        self
    }

    /// Consulted at the top of every daemon iteration with the connection
    /// and queue names.
    pub fn with_loop_guard<F>(mut self, guard: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.loop_guard = Some(Arc::new(guard));
        self
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    /// Process jobs until asked to stop.
    ///
    /// `queue` is a comma-separated list checked in order, so earlier queues
    /// take priority. An empty list means the connection's default queue.
    #[instrument(skip(self, options), fields(connection = %connection_name, queue = %queue))]
    pub async fn daemon(
        &self,
        connection_name: &str,
        queue: &str,
        options: &WorkerOptions,
    ) -> WorkerResult<StopReason> {
        let connection = self.manager.connection(Some(connection_name))?;
        let last_restart = self.restart.last_restart();

        info!(
            sleep = options.sleep,
            memory_mb = options.memory,
            timeout = options.timeout,
            max_tries = options.max_tries,
            "queue worker started"
        );

        loop {
            if !self.daemon_should_run(connection.name(), queue, options).await {
                // No job runs while gated, so nothing may be killed for overrunning.
                self.watchdog.disarm();
                self.state.sleep(pause_interval(options)).await;
                if let Some(reason) = self.stop_reason(options, last_restart) {
                    return Ok(self.stop(reason).await);
                }
                continue;
            }

            let job = self.get_next_job(&connection, queue).await;
            self.register_timeout(job.as_ref(), options);

            match job {
                Some(mut job) => {
                    if let Err(err) = self.process(connection.name(), &mut job, options).await {
                        self.report(&err);
                    }
                }
                None => self.state.sleep(Duration::from_secs(options.sleep)).await,
            }

            if let Some(reason) = self.stop_reason(options, last_restart) {
                return Ok(self.stop(reason).await);
            }
        }
    }

    /// Process at most one job. Job failures are reported, not returned.
    #[instrument(skip(self, options), fields(connection = %connection_name, queue = %queue))]
    pub async fn run_next_job(
        &self,
        connection_name: &str,
        queue: &str,
        options: &WorkerOptions,
    ) -> WorkerResult<()> {
        let connection = self.manager.connection(Some(connection_name))?;

        if self.maintenance.is_down() && !options.force {
            debug!("application is down for maintenance");
            self.state.sleep(Duration::from_secs(options.sleep)).await;
            return Ok(());
        }

        let Some(mut job) = self.get_next_job(&connection, queue).await else {
            self.state.sleep(Duration::from_secs(options.sleep)).await;
            return Ok(());
        };

        self.register_timeout(Some(&job), options);
        if let Err(err) = self.process(connection.name(), &mut job, options).await {
            self.report(&err);
        }
        self.watchdog.disarm();

        Ok(())
    }

    /// Run one reserved job through the lifecycle: events, the max-attempts
    /// guard, the body, and on failure either release or the failure
    /// pipeline. Errors from the job are returned after handling.
    pub async fn process(
        &self,
        connection_name: &str,
        job: &mut ReservedJob,
        options: &WorkerOptions,
    ) -> QueueResult<()> {
        let max_tries = options.max_tries_for(job.max_tries());

        let result = self.run_job(connection_name, job, max_tries).await;
        match result {
            Ok(()) => {
                self.events
                    .dispatch(QueueEvent::JobProcessed {
                        connection: connection_name.to_string(),
                        job: job.snapshot(),
                    })
                    .await;
                Ok(())
            }
            Err(err) => {
                self.handle_job_exception(connection_name, job, options, max_tries, &err)
                    .await;
                Err(err)
            }
        }
    }

    async fn run_job(
        &self,
        connection_name: &str,
        job: &mut ReservedJob,
        max_tries: u32,
    ) -> QueueResult<()> {
        self.events
            .dispatch(QueueEvent::JobProcessing {
                connection: connection_name.to_string(),
                job: job.snapshot(),
            })
            .await;

        // A job that already exceeded its tries (e.g. it timed out and was
        // reclaimed) is failed without running the body again.
        if max_tries > 0 && job.attempts() > max_tries {
            let err = QueueError::max_attempts_exceeded(job.display_name());
            fail_job(connection_name, job, Some(err.clone())).await?;
            return Err(err);
        }

        job.fire().await
    }

    async fn handle_job_exception(
        &self,
        connection_name: &str,
        job: &mut ReservedJob,
        options: &WorkerOptions,
        max_tries: u32,
        err: &QueueError,
    ) {
        self.events
            .dispatch(QueueEvent::JobExceptionOccurred {
                connection: connection_name.to_string(),
                job: job.snapshot(),
                error: err.clone(),
            })
            .await;

        if max_tries > 0 && job.attempts() >= max_tries {
            if let Err(fail_err) = fail_job(connection_name, job, Some(err.clone())).await {
                error!(job_id = %job.id(), error = %fail_err, "failed to mark job as failed");
            }
        }

        if job.is_deleted_or_released() || job.has_failed() {
            return;
        }

        if let Err(release_err) = job.release(Delay::Seconds(options.delay)).await {
            error!(job_id = %job.id(), error = %release_err, "failed to release job");
        }
    }

    async fn get_next_job(&self, connection: &Connection, queue: &str) -> Option<ReservedJob> {
        let queues: Vec<&str> = queue
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect();

        let popped = if queues.is_empty() {
            connection.pop(None).await
        } else {
            self.pop_first(connection, &queues).await
        };

        match popped {
            Ok(job) => job,
            Err(err) => {
                self.report(&err);
                None
            }
        }
    }

    async fn pop_first(
        &self,
        connection: &Connection,
        queues: &[&str],
    ) -> QueueResult<Option<ReservedJob>> {
        for queue in queues {
            if let Some(job) = connection.pop(Some(queue)).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn daemon_should_run(&self, connection: &str, queue: &str, options: &WorkerOptions) -> bool {
        self.events
            .dispatch(QueueEvent::Looping {
                connection: connection.to_string(),
                queue: queue.to_string(),
            })
            .await;

        if self.maintenance.is_down() && !options.force {
            return false;
        }
        if self.state.is_paused() {
            return false;
        }
        match &self.loop_guard {
            Some(guard) => guard(connection, queue),
            None => true,
        }
    }

    /// Arm the watchdog for the job's timeout (or the worker default), plus
    /// the sleep interval. A zero timeout disarms it.
    fn register_timeout(&self, job: Option<&ReservedJob>, options: &WorkerOptions) {
        let timeout = match job {
            Some(job) => options.timeout_for(job.timeout()),
            None => options.timeout,
        };

        if timeout > 0 {
            self.watchdog
                .arm(Duration::from_secs(timeout.saturating_add(options.sleep)));
        } else {
            self.watchdog.disarm();
        }
    }

    fn stop_reason(&self, options: &WorkerOptions, last_restart: Option<i64>) -> Option<StopReason> {
        if self.state.should_quit() {
            return Some(StopReason::Quit);
        }
        if self.memory_exceeded(options.memory) {
            return Some(StopReason::MemoryExceeded);
        }
        if self.restart.last_restart() != last_restart {
            return Some(StopReason::Restart);
        }
        None
    }

    /// Whether the process has reached `limit_mb`. A zero limit disables the check.
    fn memory_exceeded(&self, limit_mb: u64) -> bool {
        limit_mb > 0 && self.memory.usage_mb() >= limit_mb
    }

    async fn stop(&self, reason: StopReason) -> StopReason {
        self.watchdog.disarm();
        let status = reason.exit_status();

        match reason {
            StopReason::MemoryExceeded => {
                warn!(status, "memory limit reached; stopping queue worker")
            }
            StopReason::Restart => info!(status, "restart requested; stopping queue worker"),
            StopReason::Quit => info!(status, "stopping queue worker"),
        }

        self.events
            .dispatch(QueueEvent::WorkerStopping { status })
            .await;
        reason
    }

    /// Log a worker-level error; a lost backend connection stops the daemon
    /// so a supervisor can start a fresh process.
    fn report(&self, err: &QueueError) {
        error!(error = %err, "queue worker error");
        if err.is_lost_connection() {
            warn!("backend connection lost; worker will stop");
            self.state.quit();
        }
    }
}

fn pause_interval(options: &WorkerOptions) -> Duration {
    Duration::from_secs(options.sleep.max(1))
}

impl core::fmt::Debug for Worker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Worker")
            .field("manager", &self.manager)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_memory_stops_with_a_distinct_status() {
        assert_eq!(StopReason::Quit.exit_status(), 0);
        assert_eq!(StopReason::Restart.exit_status(), 0);
        assert_eq!(StopReason::MemoryExceeded.exit_status(), 12);
    }

    #[test]
    fn paused_worker_never_spins() {
        let options = WorkerOptions::default().with_sleep(0);
        assert_eq!(pause_interval(&options), Duration::from_secs(1));
    }
}
