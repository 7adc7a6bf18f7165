//! Posture Collector - one collection run per invocation
//!
//! ## Usage
//!
//! ```bash
//! # Run every registered plugin
//! cargo run
//!
//! # Run only Okta, with JSON logs
//! COLLECTOR_PLUGINS=okta COLLECTOR_LOG_FORMAT=json cargo run
//! ```
//!
//! ## Environment Variables
//!
//! - `TENANCY`: tenant stamped on every row and alert (default: "default")
//! - `COLLECTOR_LOG_LEVEL`: log level when `RUST_LOG` is unset (default: "info")
//! - `COLLECTOR_LOG_FORMAT`: "pretty" or "json" (default: "pretty")
//! - `COLLECTOR_HTTP_TIMEOUT_SECS`: per-request timeout (default: 30)
//! - `COLLECTOR_PLUGINS`: comma separated plugin ids to run (default: all)
//! - `COLLECTOR_METRICS_FILE`: write Prometheus text metrics here at exit
//!
//! Sink and alert variables are listed in the `config` module.
//!
//! Exits 0 when every plugin completed, 1 otherwise.

use posture_collector::config::{Config, LogFormat};
use posture_collector::context::EngineContext;
use posture_collector::gate::Environment;
use posture_collector::metrics::{self, Metrics};
use posture_collector::registry::PluginRegistry;
use posture_collector::runner::Runner;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let env = Environment::from_process();
    let config = Config::from_environment(&env)?;

    // Initialize tracing
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    Metrics::init()?;
    info!(
        tenancy = %config.tenancy,
        http_timeout_secs = config.http_timeout.as_secs(),
        "Starting posture collector"
    );

    let registry = PluginRegistry::builtin();
    let plugins = registry.select(config.plugins.as_deref())?;
    let metrics_file = config.metrics_file.clone();

    let ctx = Arc::new(EngineContext::new(env, config)?);
    info!(sinks = ?ctx.writer().sink_names(), "sinks configured");

    let summary = Runner::new(ctx).run(plugins).await;

    if let Some(path) = metrics_file {
        if let Err(e) = metrics::write_textfile(&path) {
            error!(path = %path.display(), error = %e, "failed to write metrics file");
        } else {
            info!(path = %path.display(), "metrics written");
        }
    }

    Ok(ExitCode::from(summary.exit_code() as u8))
}
