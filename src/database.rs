//! The `Database` service handed to route handlers and other collaborators.
//!
//! Constructed once at process start with [`Database::connect`], cloned into
//! whatever needs it, and shut down once with [`Database::close`].

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::config::PoolConfig;
use crate::connection::PooledConnection;
use crate::driver::Driver;
use crate::error::{DbError, Result};
use crate::executor;
use crate::pool::{ConnectionPool, PoolStatus};
use crate::transaction::{self, Transaction};
use crate::types::{Rows, Value};

#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    /// Create the pool behind this service. Fails on invalid configuration or
    /// unreadable TLS material before any connection is attempted.
    pub async fn connect(config: PoolConfig, driver: Arc<dyn Driver>) -> Result<Self> {
        let pool = ConnectionPool::create(config, driver).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Check out a connection; it is released when dropped.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.pool.acquire().await
    }

    /// Check out a connection and begin a transaction on it.
    pub async fn begin(&self) -> Result<Transaction> {
        Transaction::begin(&self.pool).await
    }

    /// Run `f` in a transaction: commit on `Ok`, roll back on `Err`, always release.
    pub async fn with_transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, std::result::Result<T, E>>,
        E: From<DbError>,
    {
        transaction::with_transaction(&self.pool, f).await
    }

    /// Acquire, run one query, release, return the rows.
    pub async fn execute_query(&self, sql: &str, params: &[Value]) -> Result<Rows> {
        executor::execute_query(&self.pool, sql, params).await
    }

    /// Acquire, run one statement, release, return the affected row count.
    pub async fn execute_statement(&self, sql: &str, params: &[Value]) -> Result<u64> {
        executor::execute_statement(&self.pool, sql, params).await
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub async fn close(&self) {
        self.pool.close().await
    }
}
