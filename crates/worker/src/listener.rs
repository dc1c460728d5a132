//! Supervisor that runs each job in a fresh child process.
//!
//! Every iteration spawns `<program> work <connection> --once ...`, waits for
//! it (killing it once the timeout passes) and starts the next one. Code
//! changes are therefore picked up without a restart, at the cost of a
//! process per job. The supervisor watches its own memory and stops with the
//! memory status once it reaches the limit.

use std::path::PathBuf;
use std::sync::Arc;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, instrument, warn};

use forgequeue_core::WorkerOptions;

use crate::error::WorkerResult;
use crate::probes::{MemoryProbe, RusageMemoryProbe};
use crate::signals::WorkerState;
use crate::worker::MEMORY_EXCEEDED_STATUS;

#[derive(Debug, Clone)]
pub struct Listener {
    program: PathBuf,
    config: Option<PathBuf>,
    state: WorkerState,
    memory: Arc<dyn MemoryProbe>,
}

impl Listener {
    /// `program` is the worker binary to spawn, usually the current executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config: None,
            state: WorkerState::new(),
            memory: Arc::new(RusageMemoryProbe),
        }
    }

    /// Config file forwarded to every child.
    pub fn with_config(mut self, config: Option<PathBuf>) -> Self {
        self.config = config;
        self
    }

    pub fn with_state(mut self, state: WorkerState) -> Self {
        self.state = state;
        self
    }

    pub fn with_memory_probe(mut self, memory: Arc<dyn MemoryProbe>) -> Self {
        self.memory = memory;
        self
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Arguments for one child worker.
    pub fn child_args(&self, connection: &str, queue: &str, options: &WorkerOptions) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.display().to_string());
        }

        args.extend([
            "work".to_string(),
            connection.to_string(),
            "--once".to_string(),
        ]);
        if !queue.is_empty() {
            args.push(format!("--queue={queue}"));
        }
        args.extend([
            format!("--delay={}", options.delay),
            format!("--memory={}", options.memory),
            format!("--sleep={}", options.sleep),
            format!("--tries={}", options.max_tries),
            format!("--timeout={}", options.timeout),
        ]);
        if options.force {
            args.push("--force".to_string());
        }
        args
    }

    /// Keep spawning children until asked to quit or the supervisor reaches
    /// its memory limit. Returns the status to exit with.
    #[instrument(skip(self, options), fields(program = %self.program.display()))]
    pub async fn listen(
        &self,
        connection: &str,
        queue: &str,
        options: &WorkerOptions,
    ) -> WorkerResult<i32> {
        info!("queue listener started");

        loop {
            if self.state.should_quit() {
                info!("stopping queue listener");
                return Ok(0);
            }

            match self.run_child(connection, queue, options).await? {
                Some(0) => {}
                Some(status) => warn!(status, "child worker exited with an error"),
                None => warn!("child worker was killed"),
            }

            if options.memory > 0 && self.memory.usage_mb() >= options.memory {
                warn!(
                    limit_mb = options.memory,
                    "listener reached its memory limit; stopping"
                );
                return Ok(MEMORY_EXCEEDED_STATUS);
            }
        }
    }

    /// Run a single child. `None` means it was killed or died from a signal.
    async fn run_child(
        &self,
        connection: &str,
        queue: &str,
        options: &WorkerOptions,
    ) -> WorkerResult<Option<i32>> {
        let mut child = Command::new(&self.program)
            .args(self.child_args(connection, queue, options))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        if options.timeout == 0 {
            return Ok(child.wait().await?.code());
        }

        let limit = Duration::from_secs(options.timeout);
        match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => Ok(status?.code()),
            Err(_) => {
                warn!(timeout_secs = options.timeout, "child worker timed out; killing it");
                child.kill().await?;
                Ok(None)
            }
        }
    }
}
