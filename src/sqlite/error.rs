//! SQLite error types.

use std::io;

use rusqlite::ErrorCode;

use crate::driver::DriverError;

pub type SqliteResult<T> = Result<T, SqliteError>;

/// SQLite-specific errors.
#[derive(Debug)]
pub enum SqliteError {
    /// I/O error
    Io(io::Error),
    /// SQLite error from rusqlite
    Sqlite(rusqlite::Error),
    /// Background connection thread error
    Worker(String),
    /// Connection closed
    ConnectionClosed,
}

impl std::fmt::Display for SqliteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqliteError::Io(e) => write!(f, "I/O error: {}", e),
            SqliteError::Sqlite(e) => write!(f, "SQLite error: {}", e),
            SqliteError::Worker(e) => write!(f, "Connection worker error: {}", e),
            SqliteError::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for SqliteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SqliteError::Io(e) => Some(e),
            SqliteError::Sqlite(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SqliteError {
    fn from(e: io::Error) -> Self {
        SqliteError::Io(e)
    }
}

impl From<rusqlite::Error> for SqliteError {
    fn from(e: rusqlite::Error) -> Self {
        SqliteError::Sqlite(e)
    }
}

impl From<tokio_rusqlite::Error> for SqliteError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        match e {
            tokio_rusqlite::Error::ConnectionClosed => SqliteError::ConnectionClosed,
            tokio_rusqlite::Error::Rusqlite(e) => SqliteError::Sqlite(e),
            other => SqliteError::Worker(other.to_string()),
        }
    }
}

/// Codes after which the database handle is not worth keeping.
fn is_fatal_code(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseCorrupt
            | ErrorCode::SystemIoFailure
    )
}

impl From<SqliteError> for DriverError {
    fn from(e: SqliteError) -> Self {
        match e {
            SqliteError::Sqlite(rusqlite::Error::SqliteFailure(failure, message)) => {
                let code = format!("{:?}", failure.code);
                let message = message.unwrap_or_else(|| failure.to_string());
                if is_fatal_code(failure.code) {
                    DriverError::fatal(code, message)
                } else {
                    DriverError::new(code, message)
                }
            }
            SqliteError::Sqlite(other) => DriverError::new("SqliteError", other.to_string()),
            SqliteError::Io(e) => DriverError::fatal("IoError", e.to_string()),
            SqliteError::Worker(msg) => DriverError::fatal("WorkerError", msg),
            SqliteError::ConnectionClosed => {
                DriverError::fatal("ConnectionClosed", "connection closed")
            }
        }
    }
}
