//! SQLite connection implementation.

use async_trait::async_trait;
use tokio_rusqlite::Connection;
use tracing::debug;

use super::error::{SqliteError, SqliteResult};
use crate::driver::{ConnectOptions, Driver, DriverConnection, DriverError};
use crate::types::{Rows, Value};

/// Driver opening SQLite connections for the pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

#[async_trait]
impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Box<dyn DriverConnection>, DriverError> {
        if options.tls.is_some() {
            debug!("TLS material is not used by the sqlite driver");
        }
        let path = options.database.as_deref().unwrap_or(":memory:");
        let conn = SqliteConnection::open(path).await?;
        Ok(Box::new(conn))
    }
}

/// A SQLite connection.
pub struct SqliteConnection {
    /// The background connection (None once closed)
    conn: Option<Connection>,
}

impl SqliteConnection {
    /// Open a SQLite database.
    ///
    /// Supports:
    /// - `:memory:` for in-memory database
    /// - File path for disk-based database
    ///
    /// File-based databases get WAL mode and a busy timeout so pooled
    /// connections can wait on each other's write locks.
    pub async fn open(path: &str) -> SqliteResult<Self> {
        let path = path.to_string();
        let is_memory = path == ":memory:";
        let conn = if is_memory {
            Connection::open_in_memory().await?
        } else {
            Connection::open(&path).await?
        };

        if !is_memory {
            conn.call(|c| {
                c.execute_batch(
                    "PRAGMA journal_mode=WAL;
                     PRAGMA synchronous=NORMAL;
                     PRAGMA busy_timeout=5000;",
                )?;
                Ok(())
            })
            .await?;
        }

        Ok(Self { conn: Some(conn) })
    }

    fn handle(&self) -> SqliteResult<&Connection> {
        self.conn.as_ref().ok_or(SqliteError::ConnectionClosed)
    }

    /// Execute a query and return results.
    /// Uses prepared statement caching for repeated queries.
    pub async fn query(&self, sql: &str, params: &[Value]) -> SqliteResult<Rows> {
        let sql = sql.to_string();
        let params: Vec<Value> = params.to_vec();

        self.handle()?
            .call(move |conn| {
                // Use prepare_cached for O(1) lookup of repeated statements
                let mut stmt = conn.prepare_cached(&sql)?;

                let columns: Vec<String> =
                    stmt.column_names().iter().map(|s| s.to_string()).collect();
                let readonly = stmt.readonly();

                let params_refs: Vec<&dyn rusqlite::ToSql> =
                    params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();

                let mut rows_data = Vec::new();
                {
                    let mut rows = stmt.query(params_refs.as_slice())?;
                    while let Some(row) = rows.next()? {
                        let mut row_values = Vec::with_capacity(columns.len());
                        for i in 0..columns.len() {
                            row_values.push(Value::from_value_ref(row.get_ref(i)?));
                        }
                        rows_data.push(row_values);
                    }
                }

                let mut result = Rows::from_values(columns, rows_data);
                if !readonly {
                    result.rows_affected = conn.changes() as u64;
                }
                Ok(result)
            })
            .await
            .map_err(SqliteError::from)
    }

    /// Execute a statement that doesn't return rows.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> SqliteResult<u64> {
        let sql = sql.to_string();
        let params: Vec<Value> = params.to_vec();

        self.handle()?
            .call(move |conn| {
                let params_refs: Vec<&dyn rusqlite::ToSql> =
                    params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();

                let rows_affected = conn.execute(&sql, params_refs.as_slice())?;
                Ok(rows_affected as u64)
            })
            .await
            .map_err(SqliteError::from)
    }

    /// Execute multiple statements (for DDL, etc.).
    pub async fn execute_batch(&self, sql: &str) -> SqliteResult<()> {
        let sql = sql.to_string();

        self.handle()?
            .call(move |conn| {
                conn.execute_batch(&sql)?;
                Ok(())
            })
            .await
            .map_err(SqliteError::from)
    }

    /// Close the connection, waiting for the background thread to finish.
    pub async fn close(&mut self) -> SqliteResult<()> {
        match self.conn.take() {
            Some(conn) => conn.close().await.map_err(SqliteError::from),
            None => Ok(()),
        }
    }

    /// Check if the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }
}

#[async_trait]
impl DriverConnection for SqliteConnection {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows, DriverError> {
        SqliteConnection::query(self, sql, params)
            .await
            .map_err(DriverError::from)
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DriverError> {
        SqliteConnection::execute(self, sql, params)
            .await
            .map_err(DriverError::from)
    }

    async fn execute_batch(&mut self, sql: &str) -> Result<(), DriverError> {
        SqliteConnection::execute_batch(self, sql)
            .await
            .map_err(DriverError::from)
    }

    fn is_closed(&self) -> bool {
        SqliteConnection::is_closed(self)
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        SqliteConnection::close(self).await.map_err(DriverError::from)
    }
}
