//! Shared Postgres plumbing for the database queue and failed-job store.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use forgequeue_core::{QueueError, QueueResult};

const BACKEND: &str = "database";

/// Build a pool that connects on first use.
///
/// Must be called from inside a tokio runtime.
pub fn connect_lazy(url: &str, max_connections: u32) -> QueueResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_lazy(url)
        .map_err(|e| map_sqlx_error("connect", e))
}

/// Table names are interpolated into SQL, so only plain identifiers
/// (optionally schema-qualified) are accepted.
pub fn validate_table_name(table: &str) -> QueueResult<()> {
    let valid = !table.is_empty()
        && table.split('.').all(|part| {
            !part.is_empty()
                && !part.starts_with(|c: char| c.is_ascii_digit())
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if valid {
        Ok(())
    } else {
        Err(QueueError::config(format!("invalid table name `{table}`")))
    }
}

/// Map a SQLx error onto the queue error model.
///
/// | SQLx error | Message |
/// |------------|---------|
/// | `Database` | `database error in <op>: <message>` (with SQLSTATE when present) |
/// | `PoolClosed` | `connection pool closed in <op>` |
/// | `Io` | `io error in <op>: <error>` |
/// | other | `sqlx error in <op>: <error>` |
pub fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    let message = match err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!(
                "database error in {operation} [{code}]: {}",
                db_err.message()
            ),
            None => format!("database error in {operation}: {}", db_err.message()),
        },
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        sqlx::Error::Io(io) => format!("io error in {operation}: {io}"),
        other => format!("sqlx error in {operation}: {other}"),
    };
    QueueError::backend(BACKEND, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_plain_identifiers() {
        assert!(validate_table_name("jobs").is_ok());
        assert!(validate_table_name("queue.failed_jobs").is_ok());

        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("jobs; drop table users").is_err());
        assert!(validate_table_name("1jobs").is_err());
        assert!(validate_table_name("public.").is_err());
    }

    #[test]
    fn closed_pool_reads_as_lost_connection() {
        let err = map_sqlx_error("pop", sqlx::Error::PoolClosed);
        assert!(err.is_lost_connection());
        assert!(err.to_string().contains("connection pool closed in pop"));
    }
}
