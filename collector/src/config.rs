//! Configuration for the collector
//!
//! Everything comes from environment variables. Sink and alert blocks are
//! `None` unless all of their required variables are set to real values, so
//! "is this sink available" is answered once, here.

use crate::error::{CollectorError, Result};
use crate::gate::Environment;
use std::path::PathBuf;
use std::time::Duration;

/// Tenancy stamped on rows when `TENANCY` is unset
pub const DEFAULT_TENANCY: &str = "default";

/// Default per-request HTTP timeout in seconds
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Main configuration for the collector
#[derive(Debug, Clone)]
pub struct Config {
    /// Tenant identifier stamped on every row and alert
    pub tenancy: String,

    /// Log level
    pub log_level: String,

    /// Log format (json or pretty)
    pub log_format: LogFormat,

    /// Per-request HTTP timeout
    pub http_timeout: Duration,

    /// Restrict the run to these plugin ids
    pub plugins: Option<Vec<String>>,

    /// Write Prometheus text exposition here at the end of the run
    pub metrics_file: Option<PathBuf>,

    pub postgres: Option<PostgresConfig>,
    pub duckdb: Option<DuckDbConfig>,
    pub bigquery: Option<BigQueryConfig>,

    /// Parquet export path template
    pub parquet_path: Option<String>,

    /// JSON-lines export path template
    pub json_path: Option<String>,

    pub alerts: AlertConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub schema: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuckDbConfig {
    pub file: PathBuf,
    pub schema: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigQueryConfig {
    pub project_id: String,
    pub dataset: String,
    /// Service account key file; application default credentials otherwise
    pub credentials: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertConfig {
    pub slack_token: Option<String>,
    pub slack_channel: Option<String>,
    pub slack_webhook: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tenancy: DEFAULT_TENANCY.to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            plugins: None,
            metrics_file: None,
            postgres: None,
            duckdb: None,
            bigquery: None,
            parquet_path: None,
            json_path: None,
            alerts: AlertConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_environment(&Environment::from_process())
    }

    /// Load configuration from an environment snapshot
    pub fn from_environment(env: &Environment) -> Result<Self> {
        let mut config = Config::default();

        if let Some(tenancy) = env.setting("TENANCY") {
            config.tenancy = tenancy;
        }

        if let Some(level) = env.setting("COLLECTOR_LOG_LEVEL") {
            config.log_level = level;
        }

        if let Some(format) = env.setting("COLLECTOR_LOG_FORMAT") {
            config.log_format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    return Err(CollectorError::Config(format!(
                        "invalid COLLECTOR_LOG_FORMAT: {other} (expected 'json' or 'pretty')"
                    )));
                }
            };
        }

        if let Some(secs) = env.setting("COLLECTOR_HTTP_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|e| {
                CollectorError::Config(format!("invalid COLLECTOR_HTTP_TIMEOUT_SECS: {e}"))
            })?;
            if secs == 0 {
                return Err(CollectorError::Config(
                    "invalid COLLECTOR_HTTP_TIMEOUT_SECS: must be positive".to_string(),
                ));
            }
            config.http_timeout = Duration::from_secs(secs);
        }

        if let Some(list) = env.setting("COLLECTOR_PLUGINS") {
            let ids: Vec<String> = list
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !ids.is_empty() {
                config.plugins = Some(ids);
            }
        }

        config.metrics_file = env.setting("COLLECTOR_METRICS_FILE").map(PathBuf::from);
        config.postgres = postgres_from(env)?;
        config.duckdb = env.configured("DUCKDB_FILE").map(|file| DuckDbConfig {
            file: PathBuf::from(file),
            schema: env.setting("DUCKDB_SCHEMA").unwrap_or_else(|| "source".to_string()),
        });
        config.bigquery = match (env.configured("BQ_PROJECT_ID"), env.configured("BQ_DATASET")) {
            (Some(project_id), Some(dataset)) => Some(BigQueryConfig {
                project_id,
                dataset,
                credentials: env
                    .configured("GOOGLE_APPLICATION_CREDENTIALS")
                    .map(PathBuf::from),
            }),
            _ => None,
        };
        config.parquet_path = env.setting("PARQUET_PATH");
        config.json_path = env.setting("UPLOAD_TARGET");
        config.alerts = AlertConfig {
            slack_token: env.configured("ALERT_SLACK_TOKEN"),
            slack_channel: env.configured("ALERT_SLACK_CHANNEL"),
            slack_webhook: env.configured("ALERT_SLACK_WEBHOOK"),
        };

        Ok(config)
    }
}

fn postgres_from(env: &Environment) -> Result<Option<PostgresConfig>> {
    let (Some(username), Some(password), Some(host), Some(database)) = (
        env.configured("POSTGRES_USERNAME"),
        env.configured("POSTGRES_PASSWORD"),
        env.configured("POSTGRES_ENDPOINT"),
        env.configured("POSTGRES_DATABASE"),
    ) else {
        return Ok(None);
    };

    let port = match env.setting("POSTGRES_PORT") {
        Some(port) => port
            .parse()
            .map_err(|e| CollectorError::Config(format!("invalid POSTGRES_PORT: {e}")))?,
        None => 5432,
    };

    Ok(Some(PostgresConfig {
        username,
        password,
        host,
        port,
        database,
        schema: env
            .setting("POSTGRES_SCHEMA")
            .unwrap_or_else(|| "public".to_string()),
    }))
}
