//! Checked-out connections and their liveness watcher.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::timeout;
use tracing::error;

use crate::config::PoolConfig;
use crate::driver::{ConnectionFault, DriverError};
use crate::error::{DbError, Result};
use crate::pool::{PoolInner, Slot};
use crate::types::{Rows, Value};

// ============================================================================
// Health
// ============================================================================

/// Liveness marker shared between a connection and its fault watcher.
///
/// `broken` is permanent and leads to destruction. `released` is set by a
/// non-fatal fault: the current holder loses the connection, and it goes back
/// to the idle stack once the guard is dropped.
#[derive(Default)]
pub(crate) struct Health {
    broken: AtomicBool,
    released: AtomicBool,
    last_fault: Mutex<Option<ConnectionFault>>,
}

impl Health {
    pub(crate) fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub(crate) fn mark_broken(&self, fault: ConnectionFault) {
        *self.last_fault.lock() = Some(fault);
        self.broken.store(true, Ordering::Release);
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn mark_released(&self, fault: ConnectionFault) {
        *self.last_fault.lock() = Some(fault);
        self.released.store(true, Ordering::Release);
    }

    /// Reset the released marker, returning the fault that set it.
    pub(crate) fn clear_released(&self) -> Option<ConnectionFault> {
        if self.released.swap(false, Ordering::AcqRel) {
            self.last_fault.lock().clone()
        } else {
            None
        }
    }

    fn last_fault(&self) -> Option<ConnectionFault> {
        self.last_fault.lock().clone()
    }
}

/// Observe asynchronous faults for one physical connection.
///
/// Spawned once per connection by the pool. Fatal faults mark the connection
/// so that release destroys it instead of returning it to the pool. Non-fatal
/// faults take the connection away from its current holder and send it back
/// to the pool on release.
pub(crate) async fn watch_faults(
    connection_id: u64,
    health: Arc<Health>,
    mut events: UnboundedReceiver<ConnectionFault>,
) {
    while let Some(fault) = events.recv().await {
        let error_data = serde_json::to_string(&fault).unwrap_or_default();
        if fault.is_fatal() {
            error!(
                connection_id,
                error_code = %fault.code,
                error_data = %error_data,
                "Sql connection lost, marking for destruction"
            );
            health.mark_broken(fault);
        } else {
            error!(
                connection_id,
                error_code = %fault.code,
                error_data = %error_data,
                "Sql connection error, releasing connection"
            );
            health.mark_released(fault);
        }
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// Exactly one holder at a time. When dropped (or [`release`]d), the
/// connection goes back to the pool, or is destroyed if it faulted.
///
/// [`release`]: PooledConnection::release
pub struct PooledConnection {
    /// The checked-out connection (None once handed back)
    slot: Option<Slot>,
    /// Reference back to the pool
    pool: Arc<PoolInner>,
    /// Semaphore permit (controls pool size)
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub(crate) fn new(slot: Slot, pool: Arc<PoolInner>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            slot: Some(slot),
            pool,
            _permit: permit,
        }
    }

    /// Pool-assigned identity of the underlying physical connection.
    pub fn id(&self) -> u64 {
        self.slot.as_ref().map(|s| s.id).unwrap_or_default()
    }

    /// Check if the connection can still be used.
    pub fn is_healthy(&self) -> bool {
        self.slot
            .as_ref()
            .map(|s| !s.health.is_broken() && !s.health.is_released() && !s.conn.is_closed())
            .unwrap_or(false)
    }

    pub fn in_transaction(&self) -> bool {
        self.slot.as_ref().map(|s| s.in_transaction).unwrap_or(false)
    }

    /// Execute a parameterized query and return its rows.
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows> {
        let limit = self.pool.config.query_timeout;
        let slot = self.start_call()?;
        let outcome = bounded(limit, slot.conn.query(sql, params)).await;
        self.settle(sql, limit, outcome, "Error in executing query", |source| {
            DbError::QueryFailed {
                query: sql.to_string(),
                source,
            }
        })
    }

    /// Execute a statement that doesn't return rows (INSERT, UPDATE, DELETE).
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let limit = self.pool.config.query_timeout;
        let slot = self.start_call()?;
        let outcome = bounded(limit, slot.conn.execute(sql, params)).await;
        self.settle(sql, limit, outcome, "Error in executing query", |source| {
            DbError::QueryFailed {
                query: sql.to_string(),
                source,
            }
        })
    }

    /// Execute unparameterized statements (DDL, session settings).
    pub async fn execute_batch(&mut self, sql: &str) -> Result<()> {
        let limit = self.pool.config.query_timeout;
        let slot = self.start_call()?;
        let outcome = bounded(limit, slot.conn.execute_batch(sql)).await;
        self.settle(sql, limit, outcome, "Error in executing query", |source| {
            DbError::QueryFailed {
                query: sql.to_string(),
                source,
            }
        })
    }

    pub(crate) async fn begin(&mut self) -> Result<()> {
        let limit = self.pool.config.query_timeout;
        let slot = self.start_call()?;
        let outcome = bounded(limit, slot.conn.begin()).await;
        self.settle("BEGIN", limit, outcome, "Error in beginning transaction", DbError::BeginFailed)?;
        self.set_in_transaction(true);
        Ok(())
    }

    pub(crate) async fn commit(&mut self) -> Result<()> {
        let limit = self.pool.config.query_timeout;
        let slot = self.start_call()?;
        let outcome = bounded(limit, slot.conn.commit()).await;
        self.settle("COMMIT", limit, outcome, "Error in committing transaction", DbError::CommitFailed)?;
        self.set_in_transaction(false);
        Ok(())
    }

    pub(crate) async fn rollback(&mut self) -> Result<()> {
        let limit = self.pool.config.query_timeout;
        let slot = self.start_call()?;
        let outcome = bounded(limit, slot.conn.rollback()).await;
        self.settle("ROLLBACK", limit, outcome, "Error in rolling back transaction", DbError::RollbackFailed)?;
        self.set_in_transaction(false);
        Ok(())
    }

    pub(crate) fn pool_config(&self) -> &PoolConfig {
        &self.pool.config
    }

    /// Hand the connection back to the pool now.
    pub fn release(self) {
        drop(self);
    }

    fn set_in_transaction(&mut self, open: bool) {
        if let Some(slot) = self.slot.as_mut() {
            slot.in_transaction = open;
        }
    }

    /// The slot, flagged as busy until `settle`, unless the watcher has
    /// already taken the connection away.
    fn start_call(&mut self) -> Result<&mut Slot> {
        let slot = self.slot.as_mut().ok_or(DbError::ConnectionClosed)?;
        if slot.health.is_broken() {
            let fault = slot.health.last_fault().unwrap_or_else(|| {
                ConnectionFault::fatal("CONNECTION_BROKEN", "connection is marked for destruction")
            });
            return Err(DbError::ConnectionFault(fault));
        }
        if slot.health.is_released() {
            let fault = slot.health.last_fault().unwrap_or_else(|| {
                ConnectionFault::non_fatal("CONNECTION_RELEASED", "connection was released by a fault")
            });
            return Err(DbError::ConnectionFault(fault));
        }
        slot.in_flight = true;
        Ok(slot)
    }

    fn mark_broken(&self, fault: ConnectionFault) {
        if let Some(slot) = self.slot.as_ref() {
            slot.health.mark_broken(fault);
        }
    }

    /// Turn a driver outcome into a result, logging and marking failures.
    fn settle<T>(
        &mut self,
        sql: &str,
        limit: Option<Duration>,
        outcome: Option<std::result::Result<T, DriverError>>,
        message: &'static str,
        on_error: impl FnOnce(DriverError) -> DbError,
    ) -> Result<T> {
        if let Some(slot) = self.slot.as_mut() {
            slot.in_flight = false;
        }
        let connection_id = self.id();
        match outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(source)) => {
                if source.fatal {
                    self.mark_broken(ConnectionFault::fatal(&source.code, &source.message));
                }
                error!(
                    connection_id,
                    query = %sql,
                    error_code = %source.code,
                    error_data = %source.to_json(),
                    "{}",
                    message
                );
                Err(on_error(source))
            }
            None => {
                let after = limit.unwrap_or_default();
                // The statement may still be running; the connection state is unknown.
                self.mark_broken(ConnectionFault::fatal(
                    "QUERY_TIMEOUT",
                    format!("statement exceeded {after:?}"),
                ));
                error!(
                    connection_id,
                    query = %sql,
                    timeout_ms = after.as_millis() as u64,
                    "Query timed out, destroying connection"
                );
                Err(DbError::QueryTimeout {
                    query: sql.to_string(),
                    after,
                })
            }
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id())
            .field("in_transaction", &self.in_transaction())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}

/// Await `fut`, giving up after `limit`. `None` means the limit was hit.
async fn bounded<T>(limit: Option<Duration>, fut: impl Future<Output = T>) -> Option<T> {
    match limit {
        Some(limit) => timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;
    use crate::pool::ConnectionPool;

    fn config() -> PoolConfig {
        PoolConfig::new("localhost", "app", "secret")
            .max_connections(1)
            .acquire_timeout(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_query_failure_keeps_connection_reusable() {
        let driver = MockDriver::new();
        let pool = ConnectionPool::create(config(), driver.clone()).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let id = conn.id();
        let err = conn.query("FAIL SELECT", &[]).await.unwrap_err();
        assert!(matches!(err, DbError::QueryFailed { .. }));
        assert!(conn.is_healthy());
        drop(conn);

        assert_eq!(pool.acquire().await.unwrap().id(), id);
    }

    #[tokio::test]
    async fn test_fatal_query_error_destroys_connection() {
        let driver = MockDriver::new();
        let pool = ConnectionPool::create(config(), driver.clone()).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let id = conn.id();
        let err = conn.query("FATAL SELECT", &[]).await.unwrap_err();
        assert!(err.driver_error().map(|e| e.fatal).unwrap_or(false));
        assert!(!conn.is_healthy());
        drop(conn);

        assert_ne!(pool.acquire().await.unwrap().id(), id);
    }

    #[tokio::test]
    async fn test_query_timeout_destroys_connection() {
        let driver = MockDriver::new();
        let pool = ConnectionPool::create(
            config().query_timeout(Duration::from_millis(20)),
            driver.clone(),
        )
        .await
        .unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let id = conn.id();
        driver.delay_statements(Duration::from_secs(5));
        let err = conn.query("SELECT SLEEP(5)", &[]).await.unwrap_err();
        assert!(matches!(err, DbError::QueryTimeout { .. }));
        drop(conn);

        driver.delay_statements(Duration::ZERO);
        assert_ne!(pool.acquire().await.unwrap().id(), id);
        assert_eq!(pool.status().destroyed, 1);
    }

    #[tokio::test]
    async fn test_cancelled_statement_destroys_connection() {
        let driver = MockDriver::new();
        let pool = ConnectionPool::create(config(), driver.clone()).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let id = conn.id();
        driver.delay_statements(Duration::from_secs(5));
        let cancelled = timeout(Duration::from_millis(20), conn.query("SELECT 1", &[])).await;
        assert!(cancelled.is_err());
        drop(conn);

        driver.delay_statements(Duration::ZERO);
        let next = pool.acquire().await.unwrap();
        assert_ne!(next.id(), id);
        assert_eq!(pool.status().destroyed, 1);
    }

    #[tokio::test]
    async fn test_debug_shows_identity() {
        let driver = MockDriver::new();
        let pool = ConnectionPool::create(config(), driver.clone()).await.unwrap();

        let conn = pool.acquire().await.unwrap();
        let rendered = format!("{conn:?}");
        assert!(rendered.contains("id: 1"));
        assert!(rendered.contains("in_transaction: false"));
    }

    #[tokio::test]
    async fn test_release_is_counted_once() {
        let driver = MockDriver::new();
        let pool = ConnectionPool::create(config(), driver.clone()).await.unwrap();

        let conn = pool.acquire().await.unwrap();
        conn.release();

        let status = pool.status();
        assert_eq!(status.checkouts, 1);
        assert_eq!(status.releases, 1);
        assert_eq!(status.in_use, 0);
    }
}
