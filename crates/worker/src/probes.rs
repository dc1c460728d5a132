//! Conditions the daemon checks between jobs: the restart marker, the
//! maintenance flag and the process's memory footprint.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::warn;

use crate::error::WorkerResult;

/// Shared "restart after the current job" timestamp.
///
/// A daemon remembers the value it saw at startup and stops once it changes.
pub trait RestartSignal: Send + Sync + core::fmt::Debug {
    /// Unix timestamp of the last restart request, if any.
    fn last_restart(&self) -> Option<i64>;

    /// Record a restart request at `at`.
    fn signal(&self, at: i64) -> WorkerResult<()>;
}

/// Restart marker stored as a timestamp in a file.
#[derive(Debug, Clone)]
pub struct FileRestartSignal {
    path: PathBuf,
}

impl FileRestartSignal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RestartSignal for FileRestartSignal {
    fn last_restart(&self) -> Option<i64> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => contents.trim().parse().ok(),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to read restart marker");
                None
            }
        }
    }

    fn signal(&self, at: i64) -> WorkerResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, at.to_string())?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRestartSignal {
    at: Mutex<Option<i64>>,
}

impl InMemoryRestartSignal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RestartSignal for InMemoryRestartSignal {
    fn last_restart(&self) -> Option<i64> {
        self.at.lock().map(|at| *at).unwrap_or(None)
    }

    fn signal(&self, at: i64) -> WorkerResult<()> {
        if let Ok(mut current) = self.at.lock() {
            *current = Some(at);
        }
        Ok(())
    }
}

/// Whether the application is down for maintenance.
pub trait MaintenanceMode: Send + Sync + core::fmt::Debug {
    fn is_down(&self) -> bool;
}

/// Down while the marker file exists.
#[derive(Debug, Clone)]
pub struct FileMaintenanceMode {
    marker: PathBuf,
}

impl FileMaintenanceMode {
    pub fn new(marker: impl Into<PathBuf>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl MaintenanceMode for FileMaintenanceMode {
    fn is_down(&self) -> bool {
        self.marker.exists()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMaintenanceMode {
    down: AtomicBool,
}

impl InMemoryMaintenanceMode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

impl MaintenanceMode for InMemoryMaintenanceMode {
    fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }
}

/// Reports the worker process's memory use in megabytes.
pub trait MemoryProbe: Send + Sync + core::fmt::Debug {
    fn usage_mb(&self) -> u64;
}

/// Peak resident set size from `getrusage`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RusageMemoryProbe;

impl MemoryProbe for RusageMemoryProbe {
    fn usage_mb(&self) -> u64 {
        use nix::sys::resource::{UsageWho, getrusage};

        match getrusage(UsageWho::RUSAGE_SELF) {
            Ok(usage) => {
                let max_rss = usage.max_rss().max(0) as u64;
                // Linux reports kilobytes, macOS reports bytes.
                if cfg!(target_os = "macos") {
                    max_rss / (1024 * 1024)
                } else {
                    max_rss / 1024
                }
            }
            Err(err) => {
                warn!(error = %err, "getrusage failed; memory limit not enforced");
                0
            }
        }
    }
}

/// A probe that reports whatever it was last set to.
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    mb: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(mb: u64) -> Self {
        Self {
            mb: AtomicU64::new(mb),
        }
    }

    pub fn set(&self, mb: u64) {
        self.mb.store(mb, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn usage_mb(&self) -> u64 {
        self.mb.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_restart_signal_round_trips_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let signal = FileRestartSignal::new(dir.path().join("framework/queue-restart"));

        assert_eq!(signal.last_restart(), None);
        signal.signal(1_700_000_000).unwrap();
        assert_eq!(signal.last_restart(), Some(1_700_000_000));
    }

    #[test]
    fn garbage_restart_marker_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue-restart");
        fs::write(&path, "soon").unwrap();

        assert_eq!(FileRestartSignal::new(path).last_restart(), None);
    }

    #[test]
    fn maintenance_follows_marker_file() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("down");
        let mode = FileMaintenanceMode::new(&marker);

        assert!(!mode.is_down());
        fs::write(&marker, "").unwrap();
        assert!(mode.is_down());
    }

    #[test]
    fn rusage_probe_reports_nonzero_usage() {
        assert!(RusageMemoryProbe.usage_mb() > 0);
    }
}
