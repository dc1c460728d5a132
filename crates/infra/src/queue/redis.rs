//! Redis-backed broker driver.
//!
//! Each queue uses three keys:
//!
//! - `<prefix><queue>`: list of ready payloads
//! - `<prefix><queue>:delayed`: sorted set scored by availability time
//! - `<prefix><queue>:reserved`: sorted set scored by reservation expiry
//!
//! Payloads carry their own `id` and `attempts`. Reservation is one Lua
//! script (pop, bump attempts, add to the reserved set) so it is atomic on
//! the server.

use async_trait::async_trait;
use redis::Script;
use redis::aio::MultiplexedConnection;
use serde_json::Value as JsonValue;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use forgequeue_core::{Delay, JobId, Payload, QueueError, QueueResult, SharedClock};

use crate::jobs::JobRecord;
use crate::queue::{PushOptions, QueueDriver};

const SIZE_SCRIPT: &str = r#"
return redis.call('llen', KEYS[1]) + redis.call('zcard', KEYS[2]) + redis.call('zcard', KEYS[3])
"#;

// KEYS[1] ready list, KEYS[2] reserved set, ARGV[1] reservation expiry.
const POP_SCRIPT: &str = r#"
local job = redis.call('lpop', KEYS[1])
local reserved = false
if (job ~= false) then
    reserved = cjson.decode(job)
    reserved['attempts'] = (reserved['attempts'] or 0) + 1
    reserved = cjson.encode(reserved)
    redis.call('zadd', KEYS[2], ARGV[1], reserved)
end
return {job, reserved}
"#;

// KEYS[1] source set, KEYS[2] ready list, ARGV[1] now.
const MIGRATE_SCRIPT: &str = r#"
local val = redis.call('zrangebyscore', KEYS[1], '-inf', ARGV[1])
if (next(val) ~= nil) then
    redis.call('zremrangebyrank', KEYS[1], 0, #val - 1)
    for i = 1, #val, 100 do
        redis.call('rpush', KEYS[2], unpack(val, i, math.min(i + 99, #val)))
    end
end
return #val
"#;

// KEYS[1] delayed set, KEYS[2] reserved set, ARGV[1] member, ARGV[2] available at.
const RELEASE_SCRIPT: &str = r#"
redis.call('zrem', KEYS[2], ARGV[1])
redis.call('zadd', KEYS[1], ARGV[2], ARGV[1])
return 1
"#;

const BACKEND: &str = "redis";

fn redis_error(operation: &str, err: redis::RedisError) -> QueueError {
    QueueError::backend(BACKEND, format!("{operation}: {err}"))
}

struct Scripts {
    size: Script,
    pop: Script,
    migrate: Script,
    release: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            size: Script::new(SIZE_SCRIPT),
            pop: Script::new(POP_SCRIPT),
            migrate: Script::new(MIGRATE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }
}

pub struct RedisQueue {
    client: redis::Client,
    connection: OnceCell<MultiplexedConnection>,
    prefix: String,
    default_queue: String,
    retry_after: u64,
    clock: SharedClock,
    scripts: Scripts,
}

impl RedisQueue {
    pub fn new(
        url: &str,
        prefix: impl Into<String>,
        default_queue: impl Into<String>,
        retry_after: u64,
        clock: SharedClock,
    ) -> QueueResult<Self> {
        let client = redis::Client::open(url).map_err(|e| redis_error("open", e))?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            prefix: prefix.into(),
            default_queue: default_queue.into(),
            retry_after,
            clock,
            scripts: Scripts::new(),
        })
    }

    async fn connection(&self) -> QueueResult<MultiplexedConnection> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| redis_error("connect", e))
            })
            .await?;
        Ok(connection.clone())
    }

    fn ready_key(&self, queue: &str) -> String {
        format!("{}{queue}", self.prefix)
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}{queue}:delayed", self.prefix)
    }

    fn reserved_key(&self, queue: &str) -> String {
        format!("{}{queue}:reserved", self.prefix)
    }

    /// Move every member of `from` scored at or before `now` onto the ready list.
    async fn migrate_expired(
        &self,
        conn: &mut MultiplexedConnection,
        from: &str,
        to: &str,
        now: i64,
    ) -> QueueResult<()> {
        let moved: i64 = self
            .scripts
            .migrate
            .key(from)
            .key(to)
            .arg(now)
            .invoke_async(conn)
            .await
            .map_err(|e| redis_error("migrate", e))?;

        if moved > 0 {
            debug!(from, to, moved, "migrated due jobs");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(prefix = %self.prefix), err)]
    async fn reserve_next(&self, queue: &str) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.connection().await?;
        let now = self.clock.timestamp();
        let ready = self.ready_key(queue);
        let reserved_key = self.reserved_key(queue);

        self.migrate_expired(&mut conn, &self.delayed_key(queue), &ready, now)
            .await?;
        self.migrate_expired(&mut conn, &reserved_key, &ready, now)
            .await?;

        let (job, reserved): (Option<String>, Option<String>) = self
            .scripts
            .pop
            .key(&ready)
            .key(&reserved_key)
            .arg(now + self.retry_after as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("pop", e))?;

        let (Some(job), Some(reserved)) = (job, reserved) else {
            return Ok(None);
        };

        let id = payload_id(&reserved).unwrap_or_else(JobId::random);
        let attempts = payload_attempts(&reserved);

        Ok(Some(
            JobRecord::new(id, queue, job, attempts)
                .with_reserved_at(now)
                .with_receipt(reserved),
        ))
    }
}

impl core::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("client", &self.client)
            .field("connected", &self.connection.initialized())
            .field("prefix", &self.prefix)
            .field("default_queue", &self.default_queue)
            .field("retry_after", &self.retry_after)
            .finish()
    }
}

fn payload_field(raw: &str, field: &str) -> Option<JsonValue> {
    serde_json::from_str::<JsonValue>(raw)
        .ok()
        .and_then(|value| value.get(field).cloned())
}

fn payload_id(raw: &str) -> Option<JobId> {
    payload_field(raw, "id")
        .and_then(|id| id.as_str().map(JobId::from))
}

fn payload_attempts(raw: &str) -> u32 {
    payload_field(raw, "attempts")
        .and_then(|attempts| attempts.as_u64())
        .unwrap_or(0) as u32
}

#[async_trait]
impl QueueDriver for RedisQueue {
    fn kind(&self) -> &'static str {
        "redis"
    }

    fn default_queue(&self) -> &str {
        &self.default_queue
    }

    fn prepare_payload(&self, payload: &mut Payload) {
        if payload.id.is_none() {
            payload.id = Some(JobId::random().to_string());
        }
        payload.attempts = Some(0);
    }

    async fn push_raw(&self, payload: String, queue: &str, options: PushOptions) -> QueueResult<JobId> {
        let mut conn = self.connection().await?;
        let now = self.clock.now();
        let id = payload_id(&payload).unwrap_or_else(JobId::random);

        match options.delay.filter(|delay| !delay.is_zero(now)) {
            Some(delay) => {
                let _: i64 = redis::cmd("ZADD")
                    .arg(self.delayed_key(queue))
                    .arg(delay.available_at(now))
                    .arg(&payload)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| redis_error("later", e))?;
            }
            None => {
                let _: i64 = redis::cmd("RPUSH")
                    .arg(self.ready_key(queue))
                    .arg(&payload)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| redis_error("push", e))?;
            }
        }

        Ok(id)
    }

    async fn bulk_raw(&self, payloads: Vec<String>, queue: &str) -> QueueResult<Vec<JobId>> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;
        let ids = payloads
            .iter()
            .map(|payload| payload_id(payload).unwrap_or_else(JobId::random))
            .collect();

        let _: i64 = redis::cmd("RPUSH")
            .arg(self.ready_key(queue))
            .arg(&payloads)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("bulk", e))?;

        Ok(ids)
    }

    async fn pop(&self, queue: &str) -> QueueResult<Option<JobRecord>> {
        self.reserve_next(queue).await
    }

    async fn delete_reserved(&self, queue: &str, job: &JobRecord) -> QueueResult<()> {
        let Some(member) = job.receipt.as_deref() else {
            return Err(QueueError::backend(BACKEND, "reserved job has no reservation member"));
        };

        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("ZREM")
            .arg(self.reserved_key(queue))
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("delete", e))?;
        Ok(())
    }

    async fn release(&self, queue: &str, job: &JobRecord, delay: Delay) -> QueueResult<()> {
        let Some(member) = job.receipt.as_deref() else {
            return Err(QueueError::backend(BACKEND, "reserved job has no reservation member"));
        };

        let mut conn = self.connection().await?;
        let available_at = delay.available_at(self.clock.now());
        let _: i64 = self
            .scripts
            .release
            .key(self.delayed_key(queue))
            .key(self.reserved_key(queue))
            .arg(member)
            .arg(available_at)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("release", e))?;
        Ok(())
    }

    async fn size(&self, queue: &str) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        let size: u64 = self
            .scripts
            .size
            .key(self.ready_key(queue))
            .key(self.delayed_key(queue))
            .key(self.reserved_key(queue))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("size", e))?;
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use forgequeue_core::ManualClock;
    use serde_json::json;

    #[test]
    fn reads_id_and_attempts_from_payload() {
        let raw = json!({"id": "abc", "attempts": 2, "job": "x"}).to_string();
        assert_eq!(payload_id(&raw), Some(JobId::from("abc")));
        assert_eq!(payload_attempts(&raw), 2);

        assert_eq!(payload_id("not json"), None);
        assert_eq!(payload_attempts("{}"), 0);
    }

    #[test]
    fn prepared_payload_carries_id_and_zero_attempts() {
        let queue = RedisQueue::new(
            "redis://127.0.0.1:6379",
            "queues:",
            "default",
            90,
            ManualClock::starting_now().shared(),
        )
        .unwrap();

        let mut payload = Payload::raw("job", json!({}));
        queue.prepare_payload(&mut payload);

        assert!(payload.id.is_some());
        assert_eq!(payload.attempts, Some(0));
        assert_eq!(queue.delayed_key("emails"), "queues:emails:delayed");
    }

    /// Runs against a live server when `REDIS_URL` is set.
    #[tokio::test]
    async fn reserve_release_and_reclaim() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            return;
        };
        let clock = ManualClock::starting_now();
        let prefix = format!("forgequeue-test-{}:", uuid::Uuid::new_v4().simple());
        let queue = RedisQueue::new(&url, prefix, "default", 90, clock.shared()).unwrap();

        let mut payload = Payload::raw("job", json!({}));
        queue.prepare_payload(&mut payload);
        let id = queue
            .push_raw(payload.encode().unwrap(), "default", PushOptions::default())
            .await
            .unwrap();

        let job = queue.pop("default").await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.attempts, 1);
        assert!(queue.pop("default").await.unwrap().is_none());

        queue.release("default", &job, Delay::Seconds(5)).await.unwrap();
        clock.advance(Duration::from_secs(5));
        let again = queue.pop("default").await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 2);

        clock.advance(Duration::from_secs(90));
        let reclaimed = queue.pop("default").await.unwrap().unwrap();
        assert_eq!(reclaimed.attempts, 3);

        queue.delete_reserved("default", &reclaimed).await.unwrap();
        assert_eq!(queue.size("default").await.unwrap(), 0);
    }
}
