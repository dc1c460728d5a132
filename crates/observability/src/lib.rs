//! Process-wide tracing setup shared by the worker binary and embedders.

pub mod tracing;

pub use crate::tracing::{LogFormat, init, init_pretty, init_with};
