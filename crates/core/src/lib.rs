//! `forgequeue-core` — queue foundation building blocks.
//!
//! This crate contains the backend-agnostic pieces shared by drivers and the
//! worker: the error taxonomy, job identifiers, time helpers, the serialized
//! payload envelope, the typed command registry and worker options.

pub mod clock;
pub mod command;
pub mod error;
pub mod id;
pub mod options;
pub mod payload;

pub use clock::{Clock, Delay, ManualClock, SharedClock, SystemClock};
pub use command::{Command, CommandRegistry, QueueAwareJob, RawHandler, ResolvedJob};
pub use error::{QueueError, QueueResult};
pub use id::JobId;
pub use options::WorkerOptions;
pub use payload::{CALL_QUEUED_HANDLER, Payload, PayloadData};
