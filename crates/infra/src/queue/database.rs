//! Postgres table-backed driver.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id           BIGSERIAL PRIMARY KEY,
//!     queue        TEXT    NOT NULL,
//!     payload      TEXT    NOT NULL,
//!     attempts     INTEGER NOT NULL DEFAULT 0,
//!     reserved_at  BIGINT  NULL,
//!     available_at BIGINT  NOT NULL,
//!     created_at   BIGINT  NOT NULL
//! );
//! ```
//!
//! Timestamps are unix seconds read from the driver's clock, never `NOW()`,
//! so every worker agrees on availability even when the database clock
//! drifts.
//!
//! ## Reservation
//!
//! `pop` selects the oldest eligible row with `FOR UPDATE SKIP LOCKED` and
//! stamps `reserved_at` plus `attempts + 1` in the same transaction, so
//! concurrent workers never reserve the same row.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, instrument};

use forgequeue_core::{Delay, JobId, QueueError, QueueResult, SharedClock};

use crate::jobs::JobRecord;
use crate::postgres::{connect_lazy, map_sqlx_error, validate_table_name};
use crate::queue::{PushOptions, QueueDriver};

#[derive(Debug, Clone)]
pub struct DatabaseQueue {
    pool: PgPool,
    table: String,
    default_queue: String,
    retry_after: u64,
    clock: SharedClock,
}

impl DatabaseQueue {
    pub fn new(
        pool: PgPool,
        table: impl Into<String>,
        default_queue: impl Into<String>,
        retry_after: u64,
        clock: SharedClock,
    ) -> QueueResult<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self {
            pool,
            table,
            default_queue: default_queue.into(),
            retry_after,
            clock,
        })
    }

    /// Build a driver over a lazily connecting pool.
    pub fn connect_lazy(
        url: &str,
        table: impl Into<String>,
        default_queue: impl Into<String>,
        retry_after: u64,
        clock: SharedClock,
    ) -> QueueResult<Self> {
        let pool = connect_lazy(url, 5)?;
        Self::new(pool, table, default_queue, retry_after, clock)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the jobs table and its reservation index if missing.
    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn migrate(&self) -> QueueResult<()> {
        let create = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id           BIGSERIAL PRIMARY KEY,
                queue        TEXT    NOT NULL,
                payload      TEXT    NOT NULL,
                attempts     INTEGER NOT NULL DEFAULT 0,
                reserved_at  BIGINT  NULL,
                available_at BIGINT  NOT NULL,
                created_at   BIGINT  NOT NULL
            )
            "#,
            table = self.table
        );
        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS {name}_queue_reserved_at_index ON {table} (queue, reserved_at)",
            name = self.table.replace('.', "_"),
            table = self.table
        );
        sqlx::query(&index)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;

        Ok(())
    }

    #[instrument(skip(self, payload), fields(table = %self.table), err)]
    async fn insert(&self, payload: &str, queue: &str, available_at: i64) -> QueueResult<JobId> {
        let now = self.clock.timestamp();
        let sql = format!(
            r#"
            INSERT INTO {} (queue, payload, attempts, reserved_at, available_at, created_at)
            VALUES ($1, $2, 0, NULL, $3, $4)
            RETURNING id
            "#,
            self.table
        );

        let row = sqlx::query(&sql)
            .bind(queue)
            .bind(payload)
            .bind(available_at)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("push", e))?;

        let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("push", e))?;
        Ok(JobId::from(id))
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn reserve_next(&self, queue: &str) -> QueueResult<Option<JobRecord>> {
        let now = self.clock.timestamp();
        let expired_before = now - self.retry_after as i64;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let select = format!(
            r#"
            SELECT id, payload, attempts, available_at
            FROM {}
            WHERE queue = $1
              AND (
                    (reserved_at IS NULL AND available_at <= $2)
                 OR (reserved_at <= $3)
              )
            ORDER BY id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
            self.table
        );

        let row = sqlx::query(&select)
            .bind(queue)
            .bind(now)
            .bind(expired_before)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("pop", e))?;

        let Some(row) = row else {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            return Ok(None);
        };

        let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("pop", e))?;
        let payload: String = row.try_get("payload").map_err(|e| map_sqlx_error("pop", e))?;
        let attempts: i32 = row.try_get("attempts").map_err(|e| map_sqlx_error("pop", e))?;
        let available_at: i64 = row
            .try_get("available_at")
            .map_err(|e| map_sqlx_error("pop", e))?;

        let update = format!(
            "UPDATE {} SET reserved_at = $1, attempts = attempts + 1 WHERE id = $2",
            self.table
        );
        sqlx::query(&update)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("reserve", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let attempts = attempts.max(0) as u32 + 1;
        debug!(job_id = id, queue, attempts, "job reserved");

        Ok(Some(
            JobRecord::new(id, queue, payload, attempts)
                .with_reserved_at(now)
                .with_available_at(available_at),
        ))
    }

    fn row_id(job: &JobRecord) -> QueueResult<i64> {
        job.id
            .as_str()
            .parse()
            .map_err(|_| QueueError::backend("database", format!("invalid job id {}", job.id)))
    }
}

#[async_trait]
impl QueueDriver for DatabaseQueue {
    fn kind(&self) -> &'static str {
        "database"
    }

    fn default_queue(&self) -> &str {
        &self.default_queue
    }

    async fn push_raw(&self, payload: String, queue: &str, options: PushOptions) -> QueueResult<JobId> {
        let available_at = options.delay.unwrap_or_default().available_at(self.clock.now());
        self.insert(&payload, queue, available_at).await
    }

    async fn bulk_raw(&self, payloads: Vec<String>, queue: &str) -> QueueResult<Vec<JobId>> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.timestamp();
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (queue, payload, attempts, reserved_at, available_at, created_at) ",
            self.table
        ));
        builder.push_values(payloads.iter(), |mut row, payload| {
            row.push_bind(queue)
                .push_bind(payload)
                .push_bind(0_i32)
                .push_bind(None::<i64>)
                .push_bind(now)
                .push_bind(now);
        });
        builder.push(" RETURNING id");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("bulk", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<i64, _>("id")
                    .map(JobId::from)
                    .map_err(|e| map_sqlx_error("bulk", e))
            })
            .collect()
    }

    async fn pop(&self, queue: &str) -> QueueResult<Option<JobRecord>> {
        self.reserve_next(queue).await
    }

    async fn delete_reserved(&self, _queue: &str, job: &JobRecord) -> QueueResult<()> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table);
        sqlx::query(&sql)
            .bind(Self::row_id(job)?)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(())
    }

    async fn release(&self, _queue: &str, job: &JobRecord, delay: Delay) -> QueueResult<()> {
        let available_at = delay.available_at(self.clock.now());
        let sql = format!(
            "UPDATE {} SET reserved_at = NULL, available_at = $1 WHERE id = $2",
            self.table
        );
        sqlx::query(&sql)
            .bind(available_at)
            .bind(Self::row_id(job)?)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("release", e))?;
        Ok(())
    }

    async fn size(&self, queue: &str) -> QueueResult<u64> {
        let sql = format!("SELECT COUNT(*) AS total FROM {} WHERE queue = $1", self.table);
        let row = sqlx::query(&sql)
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("size", e))?;
        let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("size", e))?;
        Ok(total.max(0) as u64)
    }
}
