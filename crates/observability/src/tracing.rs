//! Tracing/logging initialization.
//!
//! Filtering comes from `RUST_LOG` when set, otherwise from the level passed
//! in. Every entry point is safe to call more than once.

use tracing_subscriber::EnvFilter;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line (production default).
    #[default]
    Json,
    /// Human-readable lines for a terminal.
    Pretty,
}

/// JSON logs at `info`.
pub fn init() {
    init_with(LogFormat::Json, "info");
}

/// Human-readable logs at `debug`, for `--debug` runs.
pub fn init_pretty() {
    init_with(LogFormat::Pretty, "debug");
}

/// Initialize tracing with an explicit format and fallback level.
pub fn init_with(format: LogFormat, default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.with_target(true).try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialization_is_harmless() {
        init_pretty();
        init();
        ::tracing::info!("still logging");
    }
}
