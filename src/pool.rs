//! Connection pool.
//!
//! The pool owns every physical connection. A semaphore bounds simultaneous
//! checkouts to `max_connections`; idle connections wait in a stack and are
//! reused before new ones are opened. Each physical connection gets its fault
//! watcher exactly once, when the pool opens it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::connection::{watch_faults, Health, PooledConnection};
use crate::driver::{ConnectOptions, Driver, DriverConnection, DriverError};
use crate::error::{DbError, Result};
use crate::tls::TlsBundle;

// ============================================================================
// Slot
// ============================================================================

/// A physical connection plus the bookkeeping the pool keeps for it.
pub(crate) struct Slot {
    pub(crate) id: u64,
    pub(crate) conn: Box<dyn DriverConnection>,
    pub(crate) health: Arc<Health>,
    /// BEGIN succeeded and neither COMMIT nor ROLLBACK has yet
    pub(crate) in_transaction: bool,
    /// A driver call was started and has not completed; set while awaiting
    pub(crate) in_flight: bool,
}

impl Slot {
    fn is_reusable(&self) -> bool {
        !self.health.is_broken()
            && !self.conn.is_closed()
            && !self.in_transaction
            && !self.in_flight
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

/// Internal pool state.
pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    driver: Arc<dyn Driver>,
    options: ConnectOptions,
    /// Idle connections waiting to be used
    idle: Mutex<Vec<Slot>>,
    /// Semaphore to limit simultaneous checkouts
    semaphore: Arc<Semaphore>,
    open: AtomicU32,
    next_id: AtomicU64,
    checkouts: AtomicU64,
    releases: AtomicU64,
    destroyed: AtomicU64,
}

impl PoolInner {
    /// Open a physical connection and run the one-time setup on it.
    async fn open_connection(&self) -> Result<Slot> {
        let connect = self.driver.connect(&self.options);
        let mut conn = match timeout(self.config.acquire_timeout, connect).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(self.connect_failed(e)),
            Err(_) => {
                return Err(self.connect_failed(DriverError::new(
                    "CONNECT_TIMEOUT",
                    format!("no connection after {:?}", self.config.acquire_timeout),
                )))
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let health = Arc::new(Health::default());

        if let Some(events) = conn.take_fault_events() {
            tokio::spawn(watch_faults(id, Arc::clone(&health), events));
        }

        for sql in &self.config.init_statements {
            if let Err(e) = conn.execute_batch(sql).await {
                let _ = conn.close().await;
                error!(
                    connection_id = id,
                    query = %sql,
                    error_code = %e.code,
                    error_data = %e.to_json(),
                    "Error initialising sql connection"
                );
                return Err(DbError::ConnectFailed(e));
            }
        }

        self.open.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = id, driver = self.driver.name(), "Opened sql connection");

        Ok(Slot {
            id,
            conn,
            health,
            in_transaction: false,
            in_flight: false,
        })
    }

    fn connect_failed(&self, e: DriverError) -> DbError {
        error!(
            driver = self.driver.name(),
            host = %self.options.host,
            error_code = %e.code,
            error_data = %e.to_json(),
            "Error connecting to sql pool"
        );
        DbError::ConnectFailed(e)
    }

    /// Return a connection after checkout, or destroy it if it must not be reused.
    pub(crate) fn release(&self, slot: Slot) {
        self.releases.fetch_add(1, Ordering::Relaxed);

        if self.semaphore.is_closed() {
            self.destroy(slot, "pool closed");
        } else if slot.health.is_broken() {
            self.destroy(slot, "fatal fault");
        } else if slot.conn.is_closed() {
            self.destroy(slot, "closed by driver");
        } else if slot.in_flight {
            warn!(
                connection_id = slot.id,
                "Connection released with a statement still running"
            );
            self.destroy(slot, "cancelled mid-statement");
        } else if slot.in_transaction {
            warn!(
                connection_id = slot.id,
                "Connection released with an open transaction"
            );
            self.destroy(slot, "open transaction");
        } else {
            if let Some(fault) = slot.health.clear_released() {
                info!(
                    connection_id = slot.id,
                    error_code = %fault.code,
                    "Returning sql connection released by a non-fatal fault"
                );
            }
            debug!(connection_id = slot.id, "Released sql connection");
            self.idle.lock().push(slot);
        }
    }

    fn destroy(&self, mut slot: Slot, reason: &'static str) {
        self.open.fetch_sub(1, Ordering::Relaxed);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = slot.id, reason, "Destroying sql connection");

        // Close gracefully when a runtime is around; dropping also tears the link down.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = slot.conn.close().await;
            });
        }
    }
}

// ============================================================================
// Pool Status
// ============================================================================

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_connections: u32,
    /// Physical connections currently open (idle + checked out)
    pub open: u32,
    pub idle: u32,
    pub in_use: u32,
    pub checkouts: u64,
    pub releases: u64,
    pub destroyed: u64,
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A bounded pool of database connections.
///
/// Cloning is cheap; all clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create the pool.
    ///
    /// TLS material is read and validated before anything else touches the
    /// network, so bad certificates fail startup with no connection attempted.
    pub async fn create(config: PoolConfig, driver: Arc<dyn Driver>) -> Result<Self> {
        config.validate()?;

        let tls = match &config.tls {
            Some(files) => Some(TlsBundle::load(files)?),
            None => None,
        };

        info!(
            driver = driver.name(),
            host = %config.host,
            max_connections = config.max_connections,
            tls = tls.is_some(),
            "Creating sql connection pool"
        );

        let options = ConnectOptions {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            password: config.password.clone(),
            database: config.database.clone(),
            tls,
        };

        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
            config,
            driver,
            options,
            idle: Mutex::new(Vec::new()),
            open: AtomicU32::new(0),
            next_id: AtomicU64::new(1),
            checkouts: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        });

        let pool = Self { inner };

        // Pre-create minimum connections
        for _ in 0..pool.inner.config.min_connections {
            let slot = pool.inner.open_connection().await?;
            pool.inner.idle.lock().push(slot);
        }

        Ok(pool)
    }

    /// Check out a connection.
    ///
    /// Waits up to `acquire_timeout` for a free slot, then fails with
    /// `PoolExhausted`. Connection failures are reported as `ConnectFailed`
    /// and never retried here.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        let started = Instant::now();

        let acquire = Arc::clone(&inner.semaphore).acquire_owned();
        let permit = match timeout(inner.config.acquire_timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DbError::PoolClosed),
            Err(_) => {
                let waited = started.elapsed();
                warn!(
                    max_connections = inner.config.max_connections,
                    waited_ms = waited.as_millis() as u64,
                    "Sql connection pool exhausted"
                );
                return Err(DbError::PoolExhausted {
                    max_connections: inner.config.max_connections,
                    waited,
                });
            }
        };

        let slot = loop {
            let candidate = inner.idle.lock().pop();
            match candidate {
                Some(slot) if slot.is_reusable() => break slot,
                Some(slot) => inner.destroy(slot, "unusable while idle"),
                None => break inner.open_connection().await?,
            }
        };

        // A non-fatal fault seen while idle has already been handled.
        slot.health.clear_released();
        inner.checkouts.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = slot.id, "Checked out sql connection");

        Ok(PooledConnection::new(slot, Arc::clone(inner), permit))
    }

    /// Close the pool.
    ///
    /// New acquires fail with `PoolClosed`; idle connections are closed now,
    /// checked-out ones when their holders release them.
    pub async fn close(&self) {
        self.inner.semaphore.close();

        // Drain and close all idle connections
        let connections = {
            let mut idle = self.inner.idle.lock();
            std::mem::take(&mut *idle)
        };

        for mut slot in connections {
            let _ = slot.conn.close().await;
            self.inner.open.fetch_sub(1, Ordering::Relaxed);
            self.inner.destroyed.fetch_add(1, Ordering::Relaxed);
        }

        info!("Sql connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.semaphore.is_closed()
    }

    /// Snapshot of the pool counters.
    pub fn status(&self) -> PoolStatus {
        let checkouts = self.inner.checkouts.load(Ordering::Relaxed);
        let releases = self.inner.releases.load(Ordering::Relaxed);
        PoolStatus {
            max_connections: self.inner.config.max_connections,
            open: self.inner.open.load(Ordering::Relaxed),
            idle: self.inner.idle.lock().len() as u32,
            in_use: checkouts.saturating_sub(releases) as u32,
            checkouts,
            releases,
            destroyed: self.inner.destroyed.load(Ordering::Relaxed),
        }
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn driver_name(&self) -> &'static str {
        self.inner.driver.name()
    }
}
