use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use forgequeue_core::{QueueError, QueueResult};

use super::{FailedJob, FailedJobProvider};

#[derive(Debug, Default)]
struct Archive {
    next_id: i64,
    jobs: BTreeMap<i64, FailedJob>,
}

/// In-memory failed-job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryFailedJobProvider {
    archive: RwLock<Archive>,
}

impl InMemoryFailedJobProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> QueueResult<RwLockReadGuard<'_, Archive>> {
        self.archive
            .read()
            .map_err(|_| QueueError::backend("memory", "failed job archive lock poisoned"))
    }

    fn write(&self) -> QueueResult<RwLockWriteGuard<'_, Archive>> {
        self.archive
            .write()
            .map_err(|_| QueueError::backend("memory", "failed job archive lock poisoned"))
    }
}

#[async_trait]
impl FailedJobProvider for InMemoryFailedJobProvider {
    async fn log(
        &self,
        connection: &str,
        queue: &str,
        payload: &str,
        exception: &str,
        failed_at: DateTime<Utc>,
    ) -> QueueResult<i64> {
        let mut archive = self.write()?;
        archive.next_id += 1;
        let id = archive.next_id;
        archive.jobs.insert(
            id,
            FailedJob {
                id,
                connection: connection.to_string(),
                queue: queue.to_string(),
                payload: payload.to_string(),
                exception: exception.to_string(),
                failed_at,
            },
        );
        Ok(id)
    }

    async fn all(&self) -> QueueResult<Vec<FailedJob>> {
        Ok(self.read()?.jobs.values().rev().cloned().collect())
    }

    async fn find(&self, id: i64) -> QueueResult<Option<FailedJob>> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn forget(&self, id: i64) -> QueueResult<bool> {
        Ok(self.write()?.jobs.remove(&id).is_some())
    }

    async fn flush(&self) -> QueueResult<()> {
        self.write()?.jobs.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_find_forget_flush() {
        let provider = InMemoryFailedJobProvider::new();
        let failed_at = Utc::now();

        let first = provider
            .log("redis", "default", "{}", "boom", failed_at)
            .await
            .unwrap();
        let second = provider
            .log("redis", "emails", "{}", "bang", failed_at)
            .await
            .unwrap();

        let all = provider.all().await.unwrap();
        assert_eq!(all.iter().map(|job| job.id).collect::<Vec<_>>(), vec![second, first]);

        let found = provider.find(first).await.unwrap().unwrap();
        assert_eq!(found.exception, "boom");
        assert_eq!(found.queue, "default");
        assert_eq!(found.failed_at, failed_at);

        assert!(provider.forget(first).await.unwrap());
        assert!(!provider.forget(first).await.unwrap());
        assert!(provider.find(first).await.unwrap().is_none());

        provider.flush().await.unwrap();
        assert!(provider.all().await.unwrap().is_empty());
    }
}
