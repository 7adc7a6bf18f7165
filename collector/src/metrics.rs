//! Prometheus metrics for the collector
//!
//! The collector is a batch job, so nothing scrapes it: the text exposition
//! is written to a node-exporter textfile at the end of a run.

use crate::error::{CollectorError, Result};
use prometheus::{CounterVec, Encoder, Gauge, TextEncoder, register_counter_vec, register_gauge};
use std::path::Path;
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// All collector metrics
pub struct Metrics {
    /// Rows stored (by tag)
    pub rows_stored: CounterVec,

    /// Sink writes (by sink, outcome)
    pub sink_writes: CounterVec,

    /// Fetch retries (by reason)
    pub fetch_retries: CounterVec,

    /// Plugin runs (by outcome)
    pub plugin_runs: CounterVec,

    /// Alert deliveries (by channel, outcome)
    pub alerts_sent: CounterVec,

    /// Wall-clock duration of the last run
    pub run_duration: Gauge,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            rows_stored: register_counter_vec!(
                "collector_rows_stored_total",
                "Total rows stored into the buffer",
                &["tag"]
            )
            .map_err(|e| CollectorError::Metrics(format!("rows_stored: {e}")))?,

            sink_writes: register_counter_vec!(
                "collector_sink_writes_total",
                "Dataset replace attempts per sink",
                &["sink", "outcome"]
            )
            .map_err(|e| CollectorError::Metrics(format!("sink_writes: {e}")))?,

            fetch_retries: register_counter_vec!(
                "collector_fetch_retries_total",
                "HTTP retries taken by the fetcher",
                &["reason"]
            )
            .map_err(|e| CollectorError::Metrics(format!("fetch_retries: {e}")))?,

            plugin_runs: register_counter_vec!(
                "collector_plugin_runs_total",
                "Plugin executions",
                &["plugin", "outcome"]
            )
            .map_err(|e| CollectorError::Metrics(format!("plugin_runs: {e}")))?,

            alerts_sent: register_counter_vec!(
                "collector_alerts_total",
                "Alert deliveries",
                &["channel", "outcome"]
            )
            .map_err(|e| CollectorError::Metrics(format!("alerts_sent: {e}")))?,

            run_duration: register_gauge!(
                "collector_run_duration_seconds",
                "Duration of the last collector run"
            )
            .map_err(|e| CollectorError::Metrics(format!("run_duration: {e}")))?,
        };

        // Set the metrics (only succeeds once)
        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| CollectorError::Metrics("Failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    pub fn record_rows_stored(&self, tag: &str, count: u64) {
        self.rows_stored
            .with_label_values(&[tag])
            .inc_by(count as f64);
    }

    pub fn record_sink_write(&self, sink: &str, success: bool) {
        self.sink_writes
            .with_label_values(&[sink, outcome(success)])
            .inc();
    }

    pub fn record_fetch_retry(&self, reason: &str) {
        self.fetch_retries.with_label_values(&[reason]).inc();
    }

    pub fn record_plugin_run(&self, plugin: &str, success: bool) {
        self.plugin_runs
            .with_label_values(&[plugin, outcome(success)])
            .inc();
    }

    pub fn record_alert(&self, channel: &str, success: bool) {
        self.alerts_sent
            .with_label_values(&[channel, outcome(success)])
            .inc();
    }

    pub fn set_run_duration(&self, seconds: f64) {
        self.run_duration.set(seconds);
    }
}

fn outcome(success: bool) -> &'static str {
    if success { "success" } else { "failure" }
}

/// Gather all metrics and encode as Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

/// Write the text exposition to `path`
///
/// Written to a sibling temp file and renamed so a collecting node exporter
/// never reads a partial file.
pub fn write_textfile(path: &Path) -> Result<()> {
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, gather())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Helpers that record only if metrics were initialized
pub fn try_record_rows_stored(tag: &str, count: u64) {
    if let Some(m) = Metrics::get() {
        m.record_rows_stored(tag, count);
    }
}

pub fn try_record_sink_write(sink: &str, success: bool) {
    if let Some(m) = Metrics::get() {
        m.record_sink_write(sink, success);
    }
}

pub fn try_record_fetch_retry(reason: &str) {
    if let Some(m) = Metrics::get() {
        m.record_fetch_retry(reason);
    }
}

pub fn try_record_plugin_run(plugin: &str, success: bool) {
    if let Some(m) = Metrics::get() {
        m.record_plugin_run(plugin, success);
    }
}

pub fn try_record_alert(channel: &str, success: bool) {
    if let Some(m) = Metrics::get() {
        m.record_alert(channel, success);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init_and_textfile() {
        let _ = Metrics::init();
        if let Some(metrics) = Metrics::get() {
            metrics.record_rows_stored("okta_users", 10);
            metrics.record_sink_write("postgres", true);
            metrics.record_plugin_run("okta", false);
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.prom");
        write_textfile(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("collector_rows_stored_total"));
        assert!(!dir.path().join("collector.prom.tmp").exists());
    }
}
