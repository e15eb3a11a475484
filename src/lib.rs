//! Poolkit - pooled database access with explicit transactions.
//!
//! A bounded [`ConnectionPool`] hands out [`PooledConnection`]s, a
//! [`Transaction`] pins one connection from `BEGIN` to `COMMIT`/`ROLLBACK`,
//! and [`execute_query`] covers the acquire-run-release path for single
//! statements. Backends plug in through the [`Driver`] trait; SQLite ships
//! in-tree.

pub mod config;
pub mod connection;
pub mod database;
pub mod driver;
pub mod error;
pub mod executor;
pub mod pool;
pub mod sqlite;
pub mod tls;
pub mod transaction;
pub mod types;

#[cfg(test)]
mod mock;

pub use config::{DatabaseSettings, PoolConfig, Settings};
pub use connection::PooledConnection;
pub use database::Database;
pub use driver::{ConnectOptions, ConnectionFault, Driver, DriverConnection, DriverError, FaultKind};
pub use error::{DbError, Result};
pub use executor::{execute_query, execute_statement};
pub use pool::{ConnectionPool, PoolStatus};
pub use sqlite::SqliteDriver;
pub use tls::{TlsBundle, TlsError, TlsFiles};
pub use transaction::{with_transaction, Transaction};
pub use types::{Row, Rows, Value};
