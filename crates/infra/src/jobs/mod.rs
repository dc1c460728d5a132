//! Reserved jobs and the failure pipeline.

pub mod failing;
pub mod record;
pub mod reserved;

pub use failing::fail_job;
pub use record::JobRecord;
pub use reserved::ReservedJob;
