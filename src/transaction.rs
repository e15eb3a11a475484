//! Transactions.
//!
//! A [`Transaction`] owns one checked-out connection on which BEGIN has
//! succeeded. The contract:
//!
//! - [`Transaction::commit`] and [`Transaction::rollback`] consume the handle
//!   and always release the connection, whether or not the command succeeded.
//! - Dropping a handle that was neither committed nor rolled back rolls back
//!   in the background before the connection goes back to the pool. That
//!   rollback is bounded by `query_timeout`, or `acquire_timeout` when no
//!   query timeout is set; if it does not finish in time the connection is
//!   destroyed. Without a runtime the connection is destroyed right away,
//!   which also discards the transaction.
//! - [`with_transaction`] is the preferred entry point: it commits when the
//!   closure returns `Ok`, rolls back when it returns `Err`, and releases in
//!   both cases.

use std::fmt;

use futures::future::BoxFuture;
use tokio::time::timeout;
use tracing::{error, warn};

use crate::connection::PooledConnection;
use crate::error::{DbError, Result};
use crate::pool::ConnectionPool;
use crate::types::{Rows, Value};

/// A connection inside an open transaction.
pub struct Transaction {
    conn: Option<PooledConnection>,
}

impl Transaction {
    /// Check out a connection and issue BEGIN on it.
    ///
    /// If BEGIN fails the connection is released before `BeginFailed` is
    /// returned.
    pub async fn begin(pool: &ConnectionPool) -> Result<Self> {
        let mut conn = pool.acquire().await?;
        match conn.begin().await {
            Ok(()) => Ok(Self { conn: Some(conn) }),
            Err(err) => {
                conn.release();
                Err(err)
            }
        }
    }

    fn conn(&mut self) -> Result<&mut PooledConnection> {
        self.conn.as_mut().ok_or(DbError::ConnectionClosed)
    }

    /// Identity of the connection this transaction runs on.
    pub fn connection_id(&self) -> u64 {
        self.conn.as_ref().map(PooledConnection::id).unwrap_or_default()
    }

    /// Execute a query within the transaction.
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows> {
        self.conn()?.query(sql, params).await
    }

    /// Execute a statement within the transaction; returns the affected row count.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.conn()?.execute(sql, params).await
    }

    pub async fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql).await
    }

    /// Commit and release the connection.
    pub async fn commit(mut self) -> Result<()> {
        let mut conn = self.conn.take().ok_or(DbError::ConnectionClosed)?;
        let result = conn.commit().await;
        conn.release();
        result
    }

    /// Roll back and release the connection.
    pub async fn rollback(mut self) -> Result<()> {
        let mut conn = self.conn.take().ok_or(DbError::ConnectionClosed)?;
        let result = conn.rollback().await;
        conn.release();
        result
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("connection_id", &self.connection_id())
            .field("open", &self.conn.is_some())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        warn!(
            connection_id = conn.id(),
            "Transaction dropped without commit or rollback, rolling back"
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let config = conn.pool_config();
                let limit = config.query_timeout.unwrap_or(config.acquire_timeout);
                handle.spawn(async move {
                    // Failures are logged by the connection; it is destroyed on release.
                    if timeout(limit, conn.rollback()).await.is_err() {
                        error!(
                            connection_id = conn.id(),
                            timeout_ms = limit.as_millis() as u64,
                            "Rollback of dropped transaction timed out, destroying connection"
                        );
                    }
                });
            }
            Err(_) => {
                error!(
                    connection_id = conn.id(),
                    "No runtime to roll back on, destroying connection"
                );
                drop(conn);
            }
        }
    }
}

/// Run `f` inside a transaction.
///
/// Commits when `f` returns `Ok`, rolls back when it returns `Err`, and
/// releases the connection in every case. A failed rollback is logged and the
/// closure's error is returned.
///
/// ```ignore
/// let id = with_transaction(&pool, |tx| {
///     Box::pin(async move {
///         tx.execute("INSERT INTO users (name) VALUES (?)", &["ada".into()]).await?;
///         let rows = tx.query("SELECT last_insert_rowid() AS id", &[]).await?;
///         Ok::<_, DbError>(rows)
///     })
/// })
/// .await?;
/// ```
pub async fn with_transaction<T, E, F>(pool: &ConnectionPool, f: F) -> std::result::Result<T, E>
where
    F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, std::result::Result<T, E>>,
    E: From<DbError>,
{
    let mut tx = Transaction::begin(pool).await?;
    match f(&mut tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            let connection_id = tx.connection_id();
            if let Err(rollback_err) = tx.rollback().await {
                warn!(
                    connection_id,
                    error = %rollback_err,
                    "Rollback after failed unit of work also failed"
                );
            }
            Err(err)
        }
    }
}
