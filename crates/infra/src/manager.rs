//! Named connection resolution.
//!
//! The manager maps connection names to configured drivers through a
//! registry of connectors keyed by driver kind, and caches each connection
//! the first time it is resolved.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use forgequeue_core::{CommandRegistry, QueueError, QueueResult, SharedClock, SystemClock};
use forgequeue_events::QueueEvents;

use crate::config::{ConnectionConfig, QueueConfig};
use crate::failed::{
    DatabaseFailedJobProvider, FailedJobProvider, InMemoryFailedJobProvider, NullFailedJobProvider,
};
use crate::queue::managed::{InMemoryRemoteQueue, RemoteQueueClient};
use crate::queue::{
    Connection, DatabaseQueue, ManagedQueue, MemoryQueue, NullQueue, QueueDriver, SyncQueue,
};

/// What a connector gets besides the connection's own config.
#[derive(Debug, Clone)]
pub struct ConnectorContext {
    pub name: String,
    pub clock: SharedClock,
}

/// Builds a driver from a connection's configuration.
pub type Connector = Arc<
    dyn Fn(&ConnectionConfig, &ConnectorContext) -> QueueResult<Arc<dyn QueueDriver>> + Send + Sync,
>;

pub struct QueueManager {
    config: QueueConfig,
    registry: Arc<CommandRegistry>,
    events: Arc<QueueEvents>,
    clock: SharedClock,
    connectors: RwLock<HashMap<String, Connector>>,
    connections: RwLock<HashMap<String, Connection>>,
}

impl QueueManager {
    pub fn new(config: QueueConfig, registry: CommandRegistry) -> Self {
        let manager = Self {
            config,
            registry: Arc::new(registry),
            events: QueueEvents::shared(),
            clock: SystemClock::shared(),
            connectors: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        };
        manager.register_default_connectors();
        manager
    }

    pub fn with_events(mut self, events: Arc<QueueEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<QueueEvents> {
        &self.events
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn default_connection_name(&self) -> &str {
        &self.config.default
    }

    /// Register (or replace) the connector for a driver kind.
    pub fn extend<F>(&self, driver: impl Into<String>, connector: F)
    where
        F: Fn(&ConnectionConfig, &ConnectorContext) -> QueueResult<Arc<dyn QueueDriver>>
            + Send
            + Sync
            + 'static,
    {
        let driver = driver.into();
        match self.connectors.write() {
            Ok(mut connectors) => {
                connectors.insert(driver, Arc::new(connector));
            }
            Err(_) => warn!(driver = %driver, "connector registry lock poisoned; connector dropped"),
        }
    }

    /// Whether `name` (or the default) has been resolved already.
    pub fn connected(&self, name: Option<&str>) -> bool {
        let name = name.unwrap_or(&self.config.default);
        self.connections
            .read()
            .map(|connections| connections.contains_key(name))
            .unwrap_or(false)
    }

    /// Resolve a connection by name, building it on first use.
    pub fn connection(&self, name: Option<&str>) -> QueueResult<Connection> {
        let name = name.unwrap_or(&self.config.default);

        if let Some(connection) = self
            .connections
            .read()
            .map_err(|_| poisoned())?
            .get(name)
        {
            return Ok(connection.clone());
        }

        let connection = self.resolve(name)?;

        let mut connections = self.connections.write().map_err(|_| poisoned())?;
        Ok(connections
            .entry(name.to_string())
            .or_insert(connection)
            .clone())
    }

    fn resolve(&self, name: &str) -> QueueResult<Connection> {
        let config = self.config.connection(name)?;

        let connector = self
            .connectors
            .read()
            .map_err(|_| poisoned())?
            .get(&config.driver)
            .cloned()
            .ok_or_else(|| QueueError::UnsupportedDriver(config.driver.clone()))?;

        let context = ConnectorContext {
            name: name.to_string(),
            clock: self.clock.clone(),
        };
        let driver = connector(config, &context)?;

        info!(connection = name, driver = driver.kind(), "queue connection resolved");

        Ok(Connection::new(
            name,
            driver,
            self.registry.clone(),
            self.events.clone(),
            self.clock.clone(),
        ))
    }

    /// Build the failed-job archive named by `[failed]`.
    pub fn failed_provider(&self) -> QueueResult<Arc<dyn FailedJobProvider>> {
        let failed = &self.config.failed;
        match failed.driver.as_str() {
            "memory" => Ok(Arc::new(InMemoryFailedJobProvider::new())),
            "null" => Ok(Arc::new(NullFailedJobProvider)),
            "database" => {
                let url = failed
                    .url
                    .as_deref()
                    .ok_or_else(|| QueueError::config("database failed-job store requires `url`"))?;
                Ok(Arc::new(DatabaseFailedJobProvider::connect_lazy(
                    url,
                    failed.table.clone(),
                )?))
            }
            other => Err(QueueError::UnsupportedDriver(other.to_string())),
        }
    }

    fn register_default_connectors(&self) {
        self.extend("sync", |config, _| {
            Ok(Arc::new(SyncQueue::new(config.default_queue())) as Arc<dyn QueueDriver>)
        });

        self.extend("null", |config, _| {
            Ok(Arc::new(NullQueue::new(config.default_queue())) as Arc<dyn QueueDriver>)
        });

        self.extend("memory", |config, context| {
            Ok(Arc::new(MemoryQueue::new(
                config.default_queue(),
                config.retry_after(),
                context.clock.clone(),
            )) as Arc<dyn QueueDriver>)
        });

        self.extend("database", |config, context| {
            let queue = DatabaseQueue::connect_lazy(
                config.require_string("url")?,
                config.string("table").unwrap_or("jobs"),
                config.default_queue(),
                config.retry_after(),
                context.clock.clone(),
            )?;
            Ok(Arc::new(queue) as Arc<dyn QueueDriver>)
        });

        #[cfg(feature = "redis")]
        self.extend("redis", |config, context| {
            let queue = crate::queue::RedisQueue::new(
                config.require_string("url")?,
                config.string("prefix").unwrap_or("queues:"),
                config.default_queue(),
                config.retry_after(),
                context.clock.clone(),
            )?;
            Ok(Arc::new(queue) as Arc<dyn QueueDriver>)
        });

        self.extend("managed", |config, context| {
            let client = remote_client(config, context)?;
            Ok(Arc::new(ManagedQueue::new(
                client,
                config.require_string("prefix")?,
                config.default_queue(),
                context.clock.clone(),
            )) as Arc<dyn QueueDriver>)
        });
    }
}

/// `client = "memory"` selects the in-process emulator; anything else talks
/// HTTP to `endpoint`.
fn remote_client(
    config: &ConnectionConfig,
    context: &ConnectorContext,
) -> QueueResult<Arc<dyn RemoteQueueClient>> {
    match config.string("client").unwrap_or("http") {
        "memory" => Ok(Arc::new(InMemoryRemoteQueue::new(
            config.retry_after(),
            context.clock.clone(),
        ))),
        #[cfg(feature = "managed")]
        "http" => {
            let client = crate::queue::managed::HttpQueueClient::new(
                config.require_string("endpoint")?,
            )
            .with_wait_time(config.u64("wait_time").unwrap_or(0));
            Ok(Arc::new(client))
        }
        other => Err(QueueError::config(format!(
            "unsupported managed queue client `{other}`"
        ))),
    }
}

fn poisoned() -> QueueError {
    QueueError::backend("manager", "connection cache lock poisoned")
}

impl core::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let connected: Vec<String> = self
            .connections
            .read()
            .map(|connections| connections.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("QueueManager")
            .field("default", &self.config.default)
            .field("connected", &connected)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgequeue_core::JobId;
    use serde_json::json;

    fn config() -> QueueConfig {
        QueueConfig::default()
            .with_connection("memory", ConnectionConfig::new("memory").with_queue("work"))
            .with_connection("blackhole", ConnectionConfig::new("null"))
            .with_connection("custom", ConnectionConfig::new("custom"))
            .with_default("memory")
    }

    #[test]
    fn resolves_default_connection_once() {
        let manager = QueueManager::new(config(), CommandRegistry::new());
        assert!(!manager.connected(None));

        let first = manager.connection(None).unwrap();
        assert_eq!(first.name(), "memory");
        assert_eq!(first.driver().kind(), "memory");
        assert_eq!(first.queue_name(None), "work");
        assert!(manager.connected(None));
        assert!(!manager.connected(Some("blackhole")));

        let second = manager.connection(Some("memory")).unwrap();
        assert!(Arc::ptr_eq(first.driver(), second.driver()));
    }

    #[test]
    fn unknown_connection_and_driver_are_errors() {
        let manager = QueueManager::new(config(), CommandRegistry::new());

        assert_eq!(
            manager.connection(Some("missing")).unwrap_err(),
            QueueError::UnknownConnection("missing".to_string())
        );
        assert_eq!(
            manager.connection(Some("custom")).unwrap_err(),
            QueueError::UnsupportedDriver("custom".to_string())
        );
    }

    #[tokio::test]
    async fn extend_registers_a_custom_driver() {
        let manager = QueueManager::new(config(), CommandRegistry::new());
        manager.extend("custom", |config, _| {
            Ok(Arc::new(NullQueue::new(config.default_queue())) as Arc<dyn QueueDriver>)
        });

        let connection = manager.connection(Some("custom")).unwrap();
        assert_eq!(connection.driver().kind(), "null");

        connection
            .push_handler("anything", json!({}), None)
            .await
            .unwrap();
        assert_eq!(connection.size(None).await.unwrap(), 0);
    }

    #[test]
    fn extend_survives_a_poisoned_registry() {
        let manager = QueueManager::new(config(), CommandRegistry::new());
        let _ = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _guard = manager.connectors.write().unwrap();
                    panic!("poison the connector registry");
                })
                .join()
        });
        assert!(manager.connectors.is_poisoned());

        manager.extend("custom", |config, _| {
            Ok(Arc::new(NullQueue::new(config.default_queue())) as Arc<dyn QueueDriver>)
        });

        assert!(manager.connection(Some("custom")).is_err());
    }

    #[tokio::test]
    async fn memory_connection_round_trips_a_job() {
        let manager = QueueManager::new(config(), CommandRegistry::new());
        let connection = manager.connection(None).unwrap();

        let id = connection
            .push_handler("report", json!({"day": 1}), None)
            .await
            .unwrap();
        assert_eq!(id, JobId::from(1u64));

        let job = connection.pop(None).await.unwrap().unwrap();
        assert_eq!(job.display_name(), "report");
        assert_eq!(job.attempts(), 1);
        assert_eq!(job.queue(), "work");
    }

    #[test]
    fn managed_connection_requires_prefix() {
        let manager = QueueManager::new(
            QueueConfig::default().with_connection(
                "sqs",
                ConnectionConfig::new("managed").with_option("client", "memory"),
            ),
            CommandRegistry::new(),
        );

        let err = manager.connection(Some("sqs")).unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
    }

    #[test]
    fn failed_provider_follows_config() {
        let manager = QueueManager::new(QueueConfig::default(), CommandRegistry::new());
        assert!(manager.failed_provider().is_ok());

        let mut config = QueueConfig::default();
        config.failed.driver = "database".to_string();
        let manager = QueueManager::new(config, CommandRegistry::new());
        assert!(matches!(manager.failed_provider().unwrap_err(), QueueError::Config(_)));
    }
}
