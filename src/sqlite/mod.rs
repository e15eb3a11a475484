//! SQLite backend.
//!
//! Uses rusqlite with tokio-rusqlite for async support. The database path is
//! taken from the pool's `database` setting (`:memory:` when unset); each
//! pooled connection to `:memory:` is its own private database.

pub mod connection;
pub mod error;
pub mod types;


pub use connection::{SqliteConnection, SqliteDriver};
pub use error::{SqliteError, SqliteResult};
