//! Queue infrastructure: configuration, drivers, reserved jobs, the failure
//! pipeline, the failed-job archive and the connection manager.

pub mod config;
pub mod failed;
pub mod jobs;
pub mod manager;
pub mod postgres;
pub mod queue;

pub use config::{ConnectionConfig, FailedConfig, QueueConfig, WorkerPaths};
pub use failed::{FailedJob, FailedJobProvider, FailedJobRecorder};
pub use jobs::{JobRecord, ReservedJob, fail_job};
pub use manager::{Connector, ConnectorContext, QueueManager};
pub use queue::{Connection, PushOptions, QueueDriver};
