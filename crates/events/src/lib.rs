//! Queue lifecycle events and their distribution.

pub mod dispatcher;
pub mod event;

pub use dispatcher::{EventDispatcher, Listener, Subscription};
pub use event::{JobSnapshot, QueueEvent};

/// Dispatcher type shared by drivers, jobs and the worker.
pub type QueueEvents = EventDispatcher<QueueEvent>;
