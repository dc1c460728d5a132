//! Postgres-backed failed-job archive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use forgequeue_core::QueueResult;

use crate::postgres::{connect_lazy, map_sqlx_error, validate_table_name};

use super::{FailedJob, FailedJobProvider};

#[derive(Debug, Clone)]
pub struct DatabaseFailedJobProvider {
    pool: PgPool,
    table: String,
}

impl DatabaseFailedJobProvider {
    pub fn new(pool: PgPool, table: impl Into<String>) -> QueueResult<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { pool, table })
    }

    pub fn connect_lazy(url: &str, table: impl Into<String>) -> QueueResult<Self> {
        Self::new(connect_lazy(url, 2)?, table)
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn migrate(&self) -> QueueResult<()> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id         BIGSERIAL   PRIMARY KEY,
                connection TEXT        NOT NULL,
                queue      TEXT        NOT NULL,
                payload    TEXT        NOT NULL,
                exception  TEXT        NOT NULL,
                failed_at  TIMESTAMPTZ NOT NULL
            )
            "#,
            self.table
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate_failed", e))?;
        Ok(())
    }
}

struct FailedJobRow {
    id: i64,
    connection: String,
    queue: String,
    payload: String,
    exception: String,
    failed_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for FailedJobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(FailedJobRow {
            id: row.try_get("id")?,
            connection: row.try_get("connection")?,
            queue: row.try_get("queue")?,
            payload: row.try_get("payload")?,
            exception: row.try_get("exception")?,
            failed_at: row.try_get("failed_at")?,
        })
    }
}

impl From<FailedJobRow> for FailedJob {
    fn from(row: FailedJobRow) -> Self {
        FailedJob {
            id: row.id,
            connection: row.connection,
            queue: row.queue,
            payload: row.payload,
            exception: row.exception,
            failed_at: row.failed_at,
        }
    }
}

fn to_failed_job(row: &PgRow, operation: &str) -> QueueResult<FailedJob> {
    FailedJobRow::from_row(row)
        .map(FailedJob::from)
        .map_err(|e| map_sqlx_error(operation, e))
}

#[async_trait]
impl FailedJobProvider for DatabaseFailedJobProvider {
    async fn log(
        &self,
        connection: &str,
        queue: &str,
        payload: &str,
        exception: &str,
        failed_at: DateTime<Utc>,
    ) -> QueueResult<i64> {
        let sql = format!(
            r#"
            INSERT INTO {} (connection, queue, payload, exception, failed_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(connection)
            .bind(queue)
            .bind(payload)
            .bind(exception)
            .bind(failed_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("log_failed", e))?;

        row.try_get("id").map_err(|e| map_sqlx_error("log_failed", e))
    }

    async fn all(&self) -> QueueResult<Vec<FailedJob>> {
        let sql = format!(
            "SELECT id, connection, queue, payload, exception, failed_at FROM {} ORDER BY id DESC",
            self.table
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("all_failed", e))?;

        rows.iter().map(|row| to_failed_job(row, "all_failed")).collect()
    }

    async fn find(&self, id: i64) -> QueueResult<Option<FailedJob>> {
        let sql = format!(
            "SELECT id, connection, queue, payload, exception, failed_at FROM {} WHERE id = $1",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_failed", e))?;

        row.map(|row| to_failed_job(&row, "find_failed")).transpose()
    }

    async fn forget(&self, id: i64) -> QueueResult<bool> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table);
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("forget_failed", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn flush(&self) -> QueueResult<()> {
        let sql = format!("DELETE FROM {}", self.table);
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("flush_failed", e))?;
        Ok(())
    }
}

/// Run against a live database when `DATABASE_URL` is set.
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn archive_round_trip() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let table = format!("failed_jobs_test_{}", uuid::Uuid::new_v4().simple());
        let provider = DatabaseFailedJobProvider::connect_lazy(&url, table).unwrap();
        provider.migrate().await.unwrap();

        let id = provider
            .log("database", "default", "{}", "boom", Utc::now())
            .await
            .unwrap();
        let found = provider.find(id).await.unwrap().unwrap();
        assert_eq!(found.exception, "boom");
        assert_eq!(provider.all().await.unwrap().len(), 1);

        assert!(provider.forget(id).await.unwrap());
        provider.flush().await.unwrap();
        assert!(provider.all().await.unwrap().is_empty());
    }
}
