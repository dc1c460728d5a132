//! Worker configuration snapshot.

use serde::{Deserialize, Serialize};

/// Immutable options for one worker invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Seconds a failed job waits before it is available again.
    pub delay: u64,
    /// Resident memory ceiling in megabytes.
    pub memory: u64,
    /// Default per-job timeout in seconds (0 disables the hard kill).
    pub timeout: u64,
    /// Seconds to sleep when no job is available.
    pub sleep: u64,
    /// Default max tries (0 = unlimited).
    pub max_tries: u32,
    /// Run even when the application is in maintenance mode.
    pub force: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            delay: 0,
            memory: 128,
            timeout: 60,
            sleep: 3,
            max_tries: 0,
            force: false,
        }
    }
}

impl WorkerOptions {
    pub fn with_delay(mut self, delay: u64) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_memory(mut self, memory: u64) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sleep(mut self, sleep: u64) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Effective max tries for a job: its own override wins, else the worker default.
    pub fn max_tries_for(&self, job_max_tries: Option<u32>) -> u32 {
        job_max_tries.unwrap_or(self.max_tries)
    }

    /// Effective timeout for a job: its own override wins, else the worker default.
    pub fn timeout_for(&self, job_timeout: Option<u64>) -> u64 {
        job_timeout.unwrap_or(self.timeout)
    }
}
