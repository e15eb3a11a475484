//! poolkit-probe - open a pool from a settings file and run one statement
//!
//! Useful as a deploy-time connectivity check:
//!
//!   poolkit-probe --config db.toml --env production
//!   poolkit-probe --config db.toml --query "SELECT * FROM users WHERE id = ?" --param 7

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use poolkit::{Database, Settings, SqliteDriver, Value};
use tracing::info;

mod tracing_setup;

use tracing_setup::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(name = "poolkit-probe", version, about = "Run a statement through a poolkit pool")]
struct Cli {
    /// Settings file (TOML, keyed by environment)
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// Environment to load (falls back to POOLKIT_ENV, then the file, then "development")
    #[arg(long = "env", value_name = "NAME")]
    environment: Option<String>,

    /// Statement to run
    #[arg(long, default_value = "SELECT 1")]
    query: String,

    /// Positional parameter; repeat for each `?` placeholder
    #[arg(long = "param", value_name = "VALUE")]
    params: Vec<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

/// Integers and floats bind as numbers, `null` as NULL, anything else as text.
fn parse_param(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("null") {
        Value::Null
    } else if let Ok(i) = raw.parse::<i64>() {
        Value::Integer(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Real(f)
    } else {
        Value::Text(raw.to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = Settings::from_file(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    let environment = settings.environment_name(cli.environment.as_deref());
    init_tracing(&TracingConfig::for_environment(&environment, cli.debug))?;

    let db_settings = settings.database(&environment)?;
    if db_settings.driver != "sqlite" {
        bail!(
            "unsupported driver '{}' for environment '{}'",
            db_settings.driver,
            environment
        );
    }

    let config = db_settings.to_pool_config()?;
    info!(environment = %environment, host = %config.host, "Opening sql connection pool");
    let db = Database::connect(config, Arc::new(SqliteDriver))
        .await
        .context("Failed to open connection pool")?;

    let params: Vec<Value> = cli.params.iter().map(|p| parse_param(p)).collect();
    let result = db.execute_query(&cli.query, &params).await;
    let status = db.status();
    db.close().await;

    let rows = result.with_context(|| format!("Query failed: {}", cli.query))?;
    println!("{}", serde_json::to_string_pretty(&rows.to_json())?);
    info!(
        rows = rows.len(),
        rows_affected = rows.rows_affected,
        checkouts = status.checkouts,
        "Probe finished"
    );
    Ok(())
}
