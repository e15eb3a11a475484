//! The seam between the pool and a concrete database backend.
//!
//! A [`Driver`] opens physical connections; a [`DriverConnection`] runs
//! statements on one of them. The pool never talks to a database any other way.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::tls::TlsBundle;
use crate::types::{Rows, Value};

// ============================================================================
// Driver errors
// ============================================================================

/// Structured error payload reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverError {
    /// Driver-specific error code (e.g. `ConstraintViolation`, `ER_DUP_ENTRY`)
    pub code: String,
    /// Human readable message from the database
    pub message: String,
    /// True when the physical connection is unusable after this error
    pub fatal: bool,
}

impl DriverError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            fatal: false,
        }
    }

    /// An error after which the connection must be discarded.
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            fatal: true,
            ..Self::new(code, message)
        }
    }

    /// JSON rendering used as the `error_data` log field.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.to_string())
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for DriverError {}

// ============================================================================
// Connection faults
// ============================================================================

/// Severity of an asynchronous connection fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The link is gone (e.g. dropped by the peer); never reuse the connection.
    Fatal,
    /// Worth logging, the connection stays usable.
    NonFatal,
}

/// A fault reported by a connection outside of any in-flight statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionFault {
    pub kind: FaultKind,
    pub code: String,
    pub message: String,
}

impl ConnectionFault {
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Fatal,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn non_fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::NonFatal,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == FaultKind::Fatal
    }
}

impl fmt::Display for ConnectionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}: {}", self.kind, self.code, self.message)
    }
}

// ============================================================================
// Connect options
// ============================================================================

/// Everything a driver needs to open one physical connection.
///
/// Built once by the pool from its configuration; TLS material has already
/// been read and validated by the time a driver sees it.
#[derive(Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    pub tls: Option<TlsBundle>,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Opens physical connections for the pool.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Short backend name used in logs (e.g. "sqlite").
    fn name(&self) -> &'static str;

    /// Open a new physical connection.
    async fn connect(&self, options: &ConnectOptions)
        -> Result<Box<dyn DriverConnection>, DriverError>;
}

/// One physical connection, used by exactly one holder at a time.
#[async_trait]
pub trait DriverConnection: Send + 'static {
    /// Run a statement that returns rows.
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows, DriverError>;

    /// Run a statement that doesn't return rows; yields the affected row count.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DriverError>;

    /// Run one or more unparameterized statements.
    async fn execute_batch(&mut self, sql: &str) -> Result<(), DriverError>;

    async fn begin(&mut self) -> Result<(), DriverError> {
        self.execute_batch("BEGIN").await
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.execute_batch("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.execute_batch("ROLLBACK").await
    }

    /// Hand over the stream of asynchronous faults for this connection.
    ///
    /// Called once, when the pool first sees the connection. Backends without
    /// out-of-band error reporting return `None`.
    fn take_fault_events(&mut self) -> Option<UnboundedReceiver<ConnectionFault>> {
        None
    }

    fn is_closed(&self) -> bool;

    /// Close the physical link. Further statements fail.
    async fn close(&mut self) -> Result<(), DriverError>;
}
