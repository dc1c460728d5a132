//! Per-job timeout enforcement.
//!
//! A job body can block its task forever, so the deadline is tracked on a
//! dedicated OS thread rather than on the async runtime. When an armed
//! deadline passes without being disarmed the expiry action runs; the
//! default action terminates the whole process and leaves the job reserved
//! so its retry-after window hands it to another worker.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error};

/// What to do when a deadline passes. Receives the armed duration.
pub type ExpiryAction = Arc<dyn Fn(Duration) + Send + Sync>;

enum Control {
    Arm(Duration),
    Disarm,
    Shutdown,
}

/// Handle to the watchdog thread.
#[derive(Debug)]
pub struct Watchdog {
    control: mpsc::Sender<Control>,
    join: Option<thread::JoinHandle<()>>,
}

impl Watchdog {
    /// Watchdog whose expiry exits the process with status 1.
    pub fn spawn() -> std::io::Result<Self> {
        Self::spawn_with(Arc::new(|armed: Duration| {
            error!(
                timeout_secs = armed.as_secs(),
                "job exceeded its timeout; terminating worker"
            );
            std::process::exit(1);
        }))
    }

    pub fn spawn_with(on_expire: ExpiryAction) -> std::io::Result<Self> {
        let (control, rx) = mpsc::channel::<Control>();

        let join = thread::Builder::new()
            .name("queue-watchdog".to_string())
            .spawn(move || watch(rx, on_expire))?;

        Ok(Self {
            control,
            join: Some(join),
        })
    }

    /// Start (or restart) the countdown.
    pub fn arm(&self, timeout: Duration) {
        let _ = self.control.send(Control::Arm(timeout));
    }

    pub fn disarm(&self) {
        let _ = self.control.send(Control::Disarm);
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn watch(rx: mpsc::Receiver<Control>, on_expire: ExpiryAction) {
    let mut deadline: Option<(Instant, Duration)> = None;

    loop {
        let next = match deadline {
            Some((at, _)) => rx.recv_timeout(at.saturating_duration_since(Instant::now())),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match next {
            Ok(Control::Arm(timeout)) => deadline = Some((Instant::now() + timeout, timeout)),
            Ok(Control::Disarm) => deadline = None,
            Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if let Some((_, armed)) = deadline.take() {
                    on_expire(armed);
                }
            }
        }
    }

    debug!("watchdog stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting() -> (Watchdog, Arc<AtomicU32>) {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let watchdog = Watchdog::spawn_with(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        (watchdog, fired)
    }

    #[test]
    fn expired_deadline_fires_once() {
        let (watchdog, fired) = counting();

        watchdog.arm(Duration::from_millis(20));
        thread::sleep(Duration::from_millis(200));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disarm_cancels_the_deadline() {
        let (watchdog, fired) = counting();

        watchdog.arm(Duration::from_millis(100));
        watchdog.disarm();
        thread::sleep(Duration::from_millis(250));

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rearming_pushes_the_deadline_out() {
        let (watchdog, fired) = counting();

        watchdog.arm(Duration::from_millis(150));
        thread::sleep(Duration::from_millis(50));
        watchdog.arm(Duration::from_secs(30));
        thread::sleep(Duration::from_millis(250));

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
