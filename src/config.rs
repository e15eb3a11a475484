//! Pool configuration.
//!
//! `PoolConfig` is the immutable input to pool creation. It is either built in
//! code or read from a TOML settings file keyed by environment name:
//!
//! ```toml
//! environment = "development"
//!
//! [environments.development.database]
//! driver = "sqlite"
//! host = "localhost"
//! user = "app"
//! password = ""
//! database = "app.db"
//! connection_limit = 10
//!
//! [environments.production.database.tls]
//! enabled = true
//! ca = "/etc/ssl/db/ca.pem"
//! cert = "/etc/ssl/db/client-cert.pem"
//! key = "/etc/ssl/db/client-key.pem"
//! ```

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{DbError, Result};
use crate::tls::TlsFiles;

/// Environment variable selecting the active environment.
pub const ENV_NAME_VAR: &str = "POOLKIT_ENV";
/// Environment variable overriding the database password.
pub const PASSWORD_VAR: &str = "POOLKIT_DB_PASSWORD";

const DEFAULT_ENVIRONMENT: &str = "development";

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Database host (or file path owner for embedded backends)
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub password: String,
    /// Database / schema name; the file path for SQLite
    pub database: Option<String>,
    /// TLS files, read and validated at pool creation
    pub tls: Option<TlsFiles>,
    /// Minimum number of connections opened at startup
    pub min_connections: u32,
    /// Maximum number of simultaneous checkouts
    pub max_connections: u32,
    /// How long `acquire` waits for a free slot before `PoolExhausted`
    pub acquire_timeout: Duration,
    /// Upper bound on a single statement; `None` waits forever
    pub query_timeout: Option<Duration>,
    /// Statements run once on every new physical connection
    pub init_statements: Vec<String>,
}

impl PoolConfig {
    /// Create a new pool configuration.
    pub fn new(host: &str, user: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port: None,
            user: user.to_string(),
            password: password.to_string(),
            database: None,
            tls: None,
            min_connections: 0,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
            query_timeout: None,
            init_statements: Vec::new(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn database(mut self, database: &str) -> Self {
        self.database = Some(database.to_string());
        self
    }

    pub fn tls(mut self, files: TlsFiles) -> Self {
        self.tls = Some(files);
        self
    }

    /// Set the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Set the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    pub fn init_statement(mut self, sql: &str) -> Self {
        self.init_statements.push(sql.to_string());
        self
    }

    /// Reject configurations the pool cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(DbError::Config("host must not be empty".to_string()));
        }
        if self.max_connections == 0 {
            return Err(DbError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(DbError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(DbError::Config(
                "acquire_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Settings file
// ============================================================================

/// Top-level settings file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Default environment name when neither the caller nor `POOLKIT_ENV` picks one
    pub environment: Option<String>,
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentSettings {
    pub database: DatabaseSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_driver")]
    pub driver: String,
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: Option<String>,
    #[serde(default = "default_connection_limit")]
    pub connection_limit: u32,
    #[serde(default)]
    pub min_connections: u32,
    pub acquire_timeout_secs: Option<u64>,
    pub query_timeout_secs: Option<u64>,
    #[serde(default)]
    pub init_statements: Vec<String>,
    #[serde(default)]
    pub tls: TlsSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub enabled: bool,
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

fn default_driver() -> String {
    "sqlite".to_string()
}

fn default_connection_limit() -> u32 {
    10
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            DbError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| DbError::Config(format!("invalid settings: {e}")))
    }

    /// Pick the active environment: explicit name, then `POOLKIT_ENV`, then
    /// the file's `environment`, then "development".
    pub fn environment_name(&self, explicit: Option<&str>) -> String {
        resolve_environment(
            explicit,
            env::var(ENV_NAME_VAR).ok().as_deref(),
            self.environment.as_deref(),
        )
    }

    /// Database settings for the named environment.
    pub fn database(&self, environment: &str) -> Result<&DatabaseSettings> {
        self.environments
            .get(environment)
            .map(|e| &e.database)
            .ok_or_else(|| {
                DbError::Config(format!("no settings for environment `{environment}`"))
            })
    }
}

fn resolve_environment(
    explicit: Option<&str>,
    from_env: Option<&str>,
    from_file: Option<&str>,
) -> String {
    [explicit, from_env, from_file]
        .into_iter()
        .flatten()
        .find(|name| !name.is_empty())
        .unwrap_or(DEFAULT_ENVIRONMENT)
        .to_string()
}

impl DatabaseSettings {
    /// Turn file settings into a pool configuration, applying `POOLKIT_DB_PASSWORD`.
    pub fn to_pool_config(&self) -> Result<PoolConfig> {
        self.to_pool_config_with(env::var(PASSWORD_VAR).ok())
    }

    fn to_pool_config_with(&self, password_override: Option<String>) -> Result<PoolConfig> {
        let mut config = PoolConfig::new(
            &self.host,
            &self.user,
            &password_override.unwrap_or_else(|| self.password.clone()),
        )
        .min_connections(self.min_connections)
        .max_connections(self.connection_limit);

        config.port = self.port;
        config.database = self.database.clone();
        config.init_statements = self.init_statements.clone();
        if let Some(secs) = self.acquire_timeout_secs {
            config.acquire_timeout = Duration::from_secs(secs);
        }
        config.query_timeout = self.query_timeout_secs.map(Duration::from_secs);
        config.tls = self.tls.to_files()?;

        config.validate()?;
        Ok(config)
    }
}

impl TlsSettings {
    fn to_files(&self) -> Result<Option<TlsFiles>> {
        if !self.enabled {
            return Ok(None);
        }
        match (&self.ca, &self.cert, &self.key) {
            (Some(ca), Some(cert), Some(key)) => Ok(Some(TlsFiles {
                ca: ca.clone(),
                cert: cert.clone(),
                key: key.clone(),
            })),
            _ => Err(DbError::Config(
                "tls is enabled but ca, cert and key are not all set".to_string(),
            )),
        }
    }
}
