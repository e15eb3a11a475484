//! Error types for the pooled access layer.
//!
//! Every failure is surfaced to the immediate caller; nothing here is retried.

use std::time::Duration;

use thiserror::Error;

use crate::driver::{ConnectionFault, DriverError};
use crate::tls::TlsError;

#[derive(Error, Debug)]
pub enum DbError {
    /// The pool could not open a physical connection.
    #[error("Error connecting to sql pool: {0}")]
    ConnectFailed(#[source] DriverError),

    /// No checkout slot became free within the acquire timeout.
    #[error("Pool exhausted: no connection free after {waited:?} (max {max_connections})")]
    PoolExhausted {
        max_connections: u32,
        waited: Duration,
    },

    /// BEGIN failed after a successful checkout. The connection has been released.
    #[error("Error in beginning transaction: {0}")]
    BeginFailed(#[source] DriverError),

    #[error("Error in executing query `{query}`: {source}")]
    QueryFailed {
        query: String,
        #[source]
        source: DriverError,
    },

    /// The statement did not complete in time. The connection has been destroyed.
    #[error("Query `{query}` timed out after {after:?}")]
    QueryTimeout { query: String, after: Duration },

    #[error("Error committing transaction: {0}")]
    CommitFailed(#[source] DriverError),

    #[error("Error rolling back transaction: {0}")]
    RollbackFailed(#[source] DriverError),

    /// A checked-out connection reported a fault outside of any statement.
    #[error("Sql connection error: {0}")]
    ConnectionFault(ConnectionFault),

    #[error("Connection is no longer checked out")]
    ConnectionClosed,

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// The driver payload behind this error, when there is one.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            DbError::ConnectFailed(e)
            | DbError::BeginFailed(e)
            | DbError::CommitFailed(e)
            | DbError::RollbackFailed(e) => Some(e),
            DbError::QueryFailed { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Whether the caller should shed load rather than wait for the database.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, DbError::PoolExhausted { .. } | DbError::PoolClosed)
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
