//! Queue worker process: the daemon loop, its per-job watchdog, signal
//! handling, the restart/maintenance/memory checks, the `listen`
//! supervisor and the `forgequeue` command line.

pub mod cli;
pub mod error;
pub mod listener;
pub mod probes;
pub mod signals;
pub mod watchdog;
pub mod worker;

pub use error::{WorkerError, WorkerResult};
pub use listener::Listener;
pub use probes::{
    FileMaintenanceMode, FileRestartSignal, FixedMemoryProbe, InMemoryMaintenanceMode,
    InMemoryRestartSignal, MaintenanceMode, MemoryProbe, RestartSignal, RusageMemoryProbe,
};
pub use signals::WorkerState;
pub use watchdog::{ExpiryAction, Watchdog};
pub use worker::{LoopGuard, MEMORY_EXCEEDED_STATUS, StopReason, Worker};
