//! In-process table-backed driver.
//!
//! Rows follow the same model as the database driver: a job is ready when it
//! is unreserved and its `available_at` has passed, or when its reservation
//! is older than `retry_after`. Reservation happens under one lock.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use forgequeue_core::{Delay, JobId, QueueError, QueueResult, SharedClock};

use crate::jobs::JobRecord;
use crate::queue::{PushOptions, QueueDriver};

/// Per-queue counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: usize,
    pub delayed: usize,
    pub reserved: usize,
}

#[derive(Debug, Clone)]
struct Row {
    queue: String,
    payload: String,
    attempts: u32,
    reserved_at: Option<i64>,
    available_at: i64,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    rows: BTreeMap<u64, Row>,
}

#[derive(Debug)]
pub struct MemoryQueue {
    default_queue: String,
    retry_after: u64,
    clock: SharedClock,
    state: Mutex<State>,
}

impl MemoryQueue {
    pub fn new(default_queue: impl Into<String>, retry_after: u64, clock: SharedClock) -> Self {
        Self {
            default_queue: default_queue.into(),
            retry_after,
            clock,
            state: Mutex::new(State::default()),
        }
    }

    pub fn retry_after(&self) -> u64 {
        self.retry_after
    }

    /// Snapshot of ready / delayed / reserved counts for `queue`.
    pub fn stats(&self, queue: &str) -> QueueResult<QueueStats> {
        let now = self.clock.timestamp();
        let state = self.lock()?;

        let mut stats = QueueStats::default();
        for row in state.rows.values().filter(|row| row.queue == queue) {
            match row.reserved_at {
                Some(_) => stats.reserved += 1,
                None if row.available_at > now => stats.delayed += 1,
                None => stats.ready += 1,
            }
        }
        Ok(stats)
    }

    fn lock(&self) -> QueueResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| QueueError::backend("memory", "queue state lock poisoned"))
    }

    fn insert(state: &mut State, queue: &str, payload: String, available_at: i64) -> JobId {
        state.next_id += 1;
        let id = state.next_id;
        state.rows.insert(
            id,
            Row {
                queue: queue.to_string(),
                payload,
                attempts: 0,
                reserved_at: None,
                available_at,
            },
        );
        JobId::from(id)
    }

    fn row_id(job: &JobRecord) -> QueueResult<u64> {
        job.id
            .as_str()
            .parse()
            .map_err(|_| QueueError::backend("memory", format!("invalid job id {}", job.id)))
    }
}

#[async_trait]
impl QueueDriver for MemoryQueue {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn default_queue(&self) -> &str {
        &self.default_queue
    }

    async fn push_raw(&self, payload: String, queue: &str, options: PushOptions) -> QueueResult<JobId> {
        let now = self.clock.now();
        let available_at = options.delay.unwrap_or_default().available_at(now);

        let mut state = self.lock()?;
        Ok(Self::insert(&mut state, queue, payload, available_at))
    }

    async fn bulk_raw(&self, payloads: Vec<String>, queue: &str) -> QueueResult<Vec<JobId>> {
        let now = self.clock.timestamp();

        let mut state = self.lock()?;
        Ok(payloads
            .into_iter()
            .map(|payload| Self::insert(&mut state, queue, payload, now))
            .collect())
    }

    async fn pop(&self, queue: &str) -> QueueResult<Option<JobRecord>> {
        let now = self.clock.timestamp();
        let expired_before = now - self.retry_after as i64;

        let mut state = self.lock()?;
        let next = state.rows.iter_mut().find(|(_, row)| {
            row.queue == queue
                && match row.reserved_at {
                    None => row.available_at <= now,
                    Some(reserved_at) => reserved_at <= expired_before,
                }
        });

        let Some((id, row)) = next else {
            return Ok(None);
        };

        row.reserved_at = Some(now);
        row.attempts += 1;

        debug!(job_id = id, queue, attempts = row.attempts, "job reserved");

        Ok(Some(
            JobRecord::new(*id, queue, row.payload.clone(), row.attempts)
                .with_reserved_at(now)
                .with_available_at(row.available_at),
        ))
    }

    async fn delete_reserved(&self, _queue: &str, job: &JobRecord) -> QueueResult<()> {
        let id = Self::row_id(job)?;
        self.lock()?.rows.remove(&id);
        Ok(())
    }

    async fn release(&self, _queue: &str, job: &JobRecord, delay: Delay) -> QueueResult<()> {
        let id = Self::row_id(job)?;
        let available_at = delay.available_at(self.clock.now());

        let mut state = self.lock()?;
        if let Some(row) = state.rows.get_mut(&id) {
            row.reserved_at = None;
            row.available_at = available_at;
        }
        Ok(())
    }

    async fn size(&self, queue: &str) -> QueueResult<u64> {
        let state = self.lock()?;
        Ok(state.rows.values().filter(|row| row.queue == queue).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use forgequeue_core::ManualClock;

    fn queue() -> (MemoryQueue, ManualClock) {
        let clock = ManualClock::starting_now();
        (MemoryQueue::new("default", 90, clock.shared()), clock)
    }

    #[tokio::test]
    async fn pop_on_empty_queue_returns_none() {
        let (queue, _) = queue();
        assert!(queue.pop("default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pop_reserves_oldest_job_and_counts_the_attempt() {
        let (queue, _) = queue();
        queue.push_raw("a".into(), "default", PushOptions::default()).await.unwrap();
        queue.push_raw("b".into(), "default", PushOptions::default()).await.unwrap();

        let first = queue.pop("default").await.unwrap().unwrap();
        assert_eq!(first.raw_payload, "a");
        assert_eq!(first.attempts, 1);

        let second = queue.pop("default").await.unwrap().unwrap();
        assert_eq!(second.raw_payload, "b");

        assert!(queue.pop("default").await.unwrap().is_none());
        assert_eq!(
            queue.stats("default").unwrap(),
            QueueStats { ready: 0, delayed: 0, reserved: 2 }
        );
    }

    #[tokio::test]
    async fn delayed_job_is_invisible_until_due() {
        let (queue, clock) = queue();
        queue
            .push_raw("later".into(), "default", PushOptions::delayed(60u64))
            .await
            .unwrap();

        assert!(queue.pop("default").await.unwrap().is_none());
        assert_eq!(queue.stats("default").unwrap().delayed, 1);

        clock.advance(Duration::from_secs(59));
        assert!(queue.pop("default").await.unwrap().is_none());

        clock.advance(Duration::from_secs(1));
        assert!(queue.pop("default").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_reservation_is_reclaimed_with_another_attempt() {
        let (queue, clock) = queue();
        queue.push_raw("job".into(), "default", PushOptions::default()).await.unwrap();

        let first = queue.pop("default").await.unwrap().unwrap();
        clock.advance(Duration::from_secs(89));
        assert!(queue.pop("default").await.unwrap().is_none());

        clock.advance(Duration::from_secs(1));
        let again = queue.pop("default").await.unwrap().unwrap();

        assert_eq!(again.id, first.id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn release_keeps_identity_and_attempts() {
        let (queue, clock) = queue();
        queue.push_raw("job".into(), "default", PushOptions::default()).await.unwrap();

        let job = queue.pop("default").await.unwrap().unwrap();
        queue.release("default", &job, Delay::Seconds(10)).await.unwrap();
        assert_eq!(queue.stats("default").unwrap().delayed, 1);

        clock.advance(Duration::from_secs(10));
        let again = queue.pop("default").await.unwrap().unwrap();

        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn deleted_job_is_gone() {
        let (queue, clock) = queue();
        queue.push_raw("job".into(), "default", PushOptions::default()).await.unwrap();

        let job = queue.pop("default").await.unwrap().unwrap();
        queue.delete_reserved("default", &job).await.unwrap();

        clock.advance(Duration::from_secs(3600));
        assert!(queue.pop("default").await.unwrap().is_none());
        assert_eq!(queue.size("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let (queue, _) = queue();
        queue
            .bulk_raw(vec!["a".into(), "b".into()], "emails")
            .await
            .unwrap();

        assert!(queue.pop("default").await.unwrap().is_none());
        assert_eq!(queue.size("emails").await.unwrap(), 2);
        assert_eq!(queue.size("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_pops_never_share_a_job() {
        let (queue, _) = queue();
        let queue = Arc::new(queue);
        for n in 0..50 {
            queue
                .push_raw(format!("job-{n}"), "default", PushOptions::default())
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(job) = queue.pop("default").await.unwrap() {
                    seen.push(job.id);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        let total = all.len();
        all.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        all.dedup();

        assert_eq!(total, 50);
        assert_eq!(all.len(), 50);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn block_on<F: std::future::Future>(future: F) -> F::Output {
            tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap()
                .block_on(future)
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 128,
                ..ProptestConfig::default()
            })]

            /// Property: a job delayed by `delay` seconds becomes visible exactly
            /// when the clock has moved `delay` seconds, and is handed out once.
            #[test]
            fn delayed_job_surfaces_exactly_at_its_delay(delay in 1u64..3_600, early in 1u64..3_600) {
                let early = early.min(delay);
                let (queue, clock) = queue();

                block_on(async {
                    queue
                        .push_raw("job".into(), "default", PushOptions::delayed(delay))
                        .await
                        .unwrap();

                    clock.advance(Duration::from_secs(delay - early));
                    prop_assert!(queue.pop("default").await.unwrap().is_none());

                    clock.advance(Duration::from_secs(early));
                    prop_assert!(queue.pop("default").await.unwrap().is_some());
                    prop_assert!(queue.pop("default").await.unwrap().is_none());
                    Ok(())
                })?;
            }

            /// Property: however many pops race over `jobs` ready jobs, each job
            /// is reserved at most once and every job is reserved.
            #[test]
            fn every_job_is_reserved_at_most_once(jobs in 1usize..40, extra_pops in 0usize..20) {
                let (queue, _) = queue();

                block_on(async {
                    for n in 0..jobs {
                        queue
                            .push_raw(format!("job-{n}"), "default", PushOptions::default())
                            .await
                            .unwrap();
                    }

                    let mut seen = std::collections::HashSet::new();
                    for _ in 0..jobs + extra_pops {
                        if let Some(job) = queue.pop("default").await.unwrap() {
                            prop_assert!(seen.insert(job.id.clone()));
                        }
                    }
                    prop_assert_eq!(seen.len(), jobs);
                    Ok(())
                })?;
            }
        }
    }
}
