//! Worker run state and the OS signals that drive it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{WorkerError, WorkerResult};

/// Quit and pause flags shared between the daemon loop and signal handlers.
#[derive(Debug, Clone, Default)]
pub struct WorkerState {
    quit: CancellationToken,
    paused: Arc<AtomicBool>,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop after the current job.
    pub fn quit(&self) {
        self.quit.cancel();
    }

    pub fn should_quit(&self) -> bool {
        self.quit.is_cancelled()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early if a quit is requested.
    pub async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.quit.cancelled() => {}
        }
    }
}

/// Route SIGTERM and SIGINT to quit, SIGUSR2 to pause and SIGCONT to resume.
///
/// Must be called from within a tokio runtime.
pub fn install(state: WorkerState) -> WorkerResult<JoinHandle<()>> {
    let stream = |kind: SignalKind| signal(kind).map_err(|err| WorkerError::Signal(err.to_string()));

    let mut terminate = stream(SignalKind::terminate())?;
    let mut interrupt = stream(SignalKind::interrupt())?;
    let mut pause = stream(SignalKind::user_defined2())?;
    let mut resume = stream(SignalKind::from_raw(nix::sys::signal::Signal::SIGCONT as i32))?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = terminate.recv() => {
                    info!("SIGTERM received; stopping after the current job");
                    state.quit();
                }
                _ = interrupt.recv() => {
                    info!("SIGINT received; stopping after the current job");
                    state.quit();
                }
                _ = pause.recv() => {
                    info!("SIGUSR2 received; pausing");
                    state.pause();
                }
                _ = resume.recv() => {
                    info!("SIGCONT received; resuming");
                    state.resume();
                }
            }
        }
    }))
}
