//! Configuration loading and representation.
//!
//! ```toml
//! default = "redis"
//!
//! [connections.redis]
//! driver = "redis"
//! url = "redis://127.0.0.1:6379"
//! queue = "default"
//! retry_after = 90
//!
//! [connections.database]
//! driver = "database"
//! url = "postgres://localhost/app"
//! table = "jobs"
//!
//! [failed]
//! driver = "database"
//! url = "postgres://localhost/app"
//! table = "failed_jobs"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use forgequeue_core::{QueueError, QueueResult};

/// Env var that overrides the configured default connection.
pub const DEFAULT_CONNECTION_ENV: &str = "QUEUE_CONNECTION";

/// Seconds before an unacknowledged reservation is reclaimed.
pub const DEFAULT_RETRY_AFTER: u64 = 90;

pub const DEFAULT_QUEUE: &str = "default";

/// Top-level queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Name of the connection used when none is given.
    pub default: String,
    pub connections: BTreeMap<String, ConnectionConfig>,
    pub failed: FailedConfig,
    pub worker: WorkerPaths,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let mut connections = BTreeMap::new();
        connections.insert("sync".to_string(), ConnectionConfig::new("sync"));
        Self {
            default: "sync".to_string(),
            connections,
            failed: FailedConfig::default(),
            worker: WorkerPaths::default(),
        }
    }
}

impl QueueConfig {
    pub fn from_toml_str(raw: &str) -> QueueResult<Self> {
        toml::from_str(raw).map_err(|e| QueueError::config(format!("invalid queue config: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            QueueError::config(format!("unable to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Apply `QUEUE_CONNECTION` if it is set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(name) = std::env::var(DEFAULT_CONNECTION_ENV) {
            if !name.is_empty() {
                self.default = name;
            }
        }
        self
    }

    pub fn with_connection(mut self, name: impl Into<String>, config: ConnectionConfig) -> Self {
        self.connections.insert(name.into(), config);
        self
    }

    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default = name.into();
        self
    }

    pub fn connection(&self, name: &str) -> QueueResult<&ConnectionConfig> {
        self.connections
            .get(name)
            .ok_or_else(|| QueueError::UnknownConnection(name.to_string()))
    }
}

/// One named connection: a driver kind plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub driver: String,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub retry_after: Option<u64>,
    /// Driver-specific parameters (`url`, `table`, `prefix`, ...).
    #[serde(flatten)]
    pub options: BTreeMap<String, JsonValue>,
}

impl ConnectionConfig {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            queue: None,
            retry_after: None,
            options: BTreeMap::new(),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn default_queue(&self) -> &str {
        self.queue.as_deref().unwrap_or(DEFAULT_QUEUE)
    }

    pub fn retry_after(&self) -> u64 {
        self.retry_after.unwrap_or(DEFAULT_RETRY_AFTER)
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(JsonValue::as_str)
    }

    pub fn require_string(&self, key: &str) -> QueueResult<&str> {
        self.string(key).ok_or_else(|| {
            QueueError::config(format!(
                "{} connection requires a `{key}` option",
                self.driver
            ))
        })
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(JsonValue::as_u64)
    }
}

/// Where failed jobs are archived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailedConfig {
    /// `memory`, `database` or `null`.
    pub driver: String,
    pub table: String,
    pub url: Option<String>,
}

impl Default for FailedConfig {
    fn default() -> Self {
        Self {
            driver: "memory".to_string(),
            table: "failed_jobs".to_string(),
            url: None,
        }
    }
}

/// Marker files read by the worker between iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPaths {
    /// Holds the timestamp of the last requested restart.
    pub restart_marker: PathBuf,
    /// Present while the application is in maintenance mode.
    pub maintenance_marker: PathBuf,
}

impl Default for WorkerPaths {
    fn default() -> Self {
        Self {
            restart_marker: PathBuf::from("storage/framework/queue-restart"),
            maintenance_marker: PathBuf::from("storage/framework/down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connections_with_driver_options() {
        let config = QueueConfig::from_toml_str(
            r#"
            default = "redis"

            [connections.redis]
            driver = "redis"
            url = "redis://127.0.0.1:6379"
            retry_after = 30

            [connections.database]
            driver = "database"
            table = "jobs"
            queue = "emails"

            [failed]
            driver = "null"
            "#,
        )
        .unwrap();

        assert_eq!(config.default, "redis");

        let redis = config.connection("redis").unwrap();
        assert_eq!(redis.driver, "redis");
        assert_eq!(redis.retry_after(), 30);
        assert_eq!(redis.default_queue(), "default");
        assert_eq!(redis.string("url"), Some("redis://127.0.0.1:6379"));

        let database = config.connection("database").unwrap();
        assert_eq!(database.default_queue(), "emails");
        assert_eq!(database.retry_after(), DEFAULT_RETRY_AFTER);
        assert_eq!(database.string("table"), Some("jobs"));

        assert_eq!(config.failed.driver, "null");
        assert_eq!(config.failed.table, "failed_jobs");
    }

    #[test]
    fn unknown_connection_is_an_error() {
        let config = QueueConfig::default();
        assert_eq!(
            config.connection("nope").unwrap_err(),
            QueueError::UnknownConnection("nope".to_string())
        );
    }

    #[test]
    fn missing_required_option_names_the_driver() {
        let config = ConnectionConfig::new("managed");
        let err = config.require_string("prefix").unwrap_err();
        assert!(err.to_string().contains("managed connection requires a `prefix` option"));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.toml");
        std::fs::write(&path, "default = \"memory\"\n[connections.memory]\ndriver = \"memory\"\n")
            .unwrap();

        let config = QueueConfig::load(&path).unwrap();
        assert_eq!(config.default, "memory");
        assert!(config.connection("memory").is_ok());
    }
}
