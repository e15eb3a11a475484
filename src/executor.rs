//! Single-statement convenience path.
//!
//! Acquire, run, release, return. The connection is always handed back before
//! the caller sees the result, so no pool slot is held while rows are
//! processed.

use crate::error::Result;
use crate::pool::ConnectionPool;
use crate::types::{Rows, Value};

/// Run a parameterized query on a pooled connection and return its rows.
///
/// Parameters are bound positionally by the driver, never spliced into the
/// SQL text. Failures are logged with the query text and driver payload, then
/// returned as `QueryFailed`; nothing is retried.
pub async fn execute_query(pool: &ConnectionPool, sql: &str, params: &[Value]) -> Result<Rows> {
    let mut conn = pool.acquire().await?;
    let result = conn.query(sql, params).await;
    conn.release();
    result
}

/// Run a statement that doesn't return rows; returns the affected row count.
pub async fn execute_statement(pool: &ConnectionPool, sql: &str, params: &[Value]) -> Result<u64> {
    let mut conn = pool.acquire().await?;
    let result = conn.execute(sql, params).await;
    conn.release();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::error::DbError;
    use crate::mock::MockDriver;
    use serde_json::json;
    use std::time::Duration;

    fn config(max: u32) -> PoolConfig {
        PoolConfig::new("localhost", "app", "secret")
            .max_connections(max)
            .acquire_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_execute_query_releases_on_success() {
        let driver = MockDriver::new();
        let pool = ConnectionPool::create(config(1), driver.clone()).await.unwrap();

        let rows = execute_query(&pool, "SELECT 1", &[]).await.unwrap();
        assert_eq!(rows.to_json(), json!([{ "1": 1 }]));

        let status = pool.status();
        assert_eq!((status.checkouts, status.releases), (1, 1));
        assert_eq!(status.idle, 1);
    }

    #[tokio::test]
    async fn test_execute_query_releases_on_failure() {
        let driver = MockDriver::new();
        let pool = ConnectionPool::create(config(1), driver.clone()).await.unwrap();

        let err = execute_query(&pool, "FAIL SELECT", &[]).await.unwrap_err();
        match err {
            DbError::QueryFailed { query, source } => {
                assert_eq!(query, "FAIL SELECT");
                assert_eq!(source.code, "ER_PARSE_ERROR");
            }
            other => panic!("expected QueryFailed, got {other:?}"),
        }

        let status = pool.status();
        assert_eq!((status.checkouts, status.releases), (1, 1));
        assert_eq!(status.in_use, 0);
    }

    #[tokio::test]
    async fn test_execute_statement_returns_affected_rows() {
        let driver = MockDriver::new();
        let pool = ConnectionPool::create(config(1), driver.clone()).await.unwrap();

        let affected = execute_statement(&pool, "UPDATE t SET x = ?", &[Value::Integer(2)])
            .await
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(pool.status().releases, 1);
    }

    #[tokio::test]
    async fn test_execute_query_serializes_on_single_connection() {
        let driver = MockDriver::new();
        driver.delay_statements(Duration::from_millis(30));
        let pool = ConnectionPool::create(config(1), driver.clone()).await.unwrap();

        let (a, b) = tokio::join!(
            execute_query(&pool, "SELECT 1", &[]),
            execute_query(&pool, "SELECT 1", &[]),
        );

        assert_eq!(a.unwrap().to_json(), json!([{ "1": 1 }]));
        assert_eq!(b.unwrap().to_json(), json!([{ "1": 1 }]));
        assert_eq!(driver.connects(), 1);
        assert_eq!(pool.status().checkouts, 2);
    }
}
