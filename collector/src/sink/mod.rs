//! Dataset sinks
//!
//! A flush replaces the whole table (or file) for one dataset in every
//! configured sink. Sinks are tried in a fixed priority order and fail
//! independently: a broken warehouse never stops the file exports.
//!
//! ```text
//! RowBuffer::take(tag) ──► SinkWriter ──► PostgreSQL
//!                                    ├──► DuckDB
//!                                    ├──► BigQuery
//!                                    ├──► Parquet file
//!                                    └──► JSON-lines file
//! ```

#[cfg(feature = "bigquery")]
pub mod bigquery;
#[cfg(feature = "duckdb")]
pub mod duckdb;
pub mod ensure;
pub mod json;
pub mod parquet;
pub mod path;
pub mod postgres;

pub use ensure::SchemaEnsurer;
pub use json::JsonLinesSink;
pub use self::parquet::ParquetSink;
pub use path::PathTemplate;
pub use postgres::PostgresSink;

use crate::buffer::RowBuffer;
use crate::config::Config;
use crate::error::SinkError;
use crate::metrics;
use crate::schema::{Row, Schema};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Rows of one dataset, shaped by its stamped schema
#[derive(Debug, Clone)]
pub struct Batch {
    pub tag: String,
    /// Declared columns followed by `tenancy` and `upload_timestamp`
    pub schema: Schema,
    pub rows: Vec<Row>,
}

/// Storage backend
///
/// # Example
///
/// ```ignore
/// struct MySink;
///
/// #[async_trait]
/// impl Sink for MySink {
///     fn name(&self) -> &'static str { "my-sink" }
///
///     async fn replace(&self, batch: &Batch) -> Result<(), SinkError> {
///         // drop + recreate + insert batch.rows
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Sink: Send + Sync {
    /// Sink name for identification and logging
    fn name(&self) -> &'static str;

    /// Whether this sink should be written to
    fn is_available(&self) -> bool {
        true
    }

    /// Create the schema / dataset / directory the sink writes into
    ///
    /// Must be idempotent. Called through [`SchemaEnsurer`], so it only runs
    /// until it first succeeds.
    async fn create_namespace(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Replace the dataset `batch.tag` with exactly `batch.rows`
    async fn replace(&self, batch: &Batch) -> Result<(), SinkError>;

    /// Release connections
    async fn shutdown(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// What one flush did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub tag: String,
    /// Rows handed to the sinks
    pub rows: usize,
    /// Sinks that replaced the dataset
    pub written: Vec<&'static str>,
    /// Sinks that failed, with the error
    pub failed: Vec<(&'static str, String)>,
}

struct SinkSlot {
    sink: Arc<dyn Sink>,
    namespace: SchemaEnsurer,
}

/// Writes buffered datasets to every configured sink
pub struct SinkWriter {
    slots: Vec<SinkSlot>,
}

impl SinkWriter {
    /// Writer with no sinks
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Add a sink at the end of the priority order
    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        info!(sink = sink.name(), "registered sink");
        self.slots.push(SinkSlot {
            sink,
            namespace: SchemaEnsurer::new(),
        });
        self
    }

    /// Build the sinks the configuration enables, in priority order
    pub fn from_config(config: &Config) -> Self {
        let mut writer = SinkWriter::new();

        if let Some(pg) = &config.postgres {
            writer = writer.with_sink(Arc::new(PostgresSink::new(pg.clone())));
        }

        if let Some(duck) = &config.duckdb {
            #[cfg(feature = "duckdb")]
            {
                writer = writer.with_sink(Arc::new(duckdb::DuckDbSink::new(duck.clone())));
            }
            #[cfg(not(feature = "duckdb"))]
            warn!(file = %duck.file.display(), "DUCKDB_FILE set but built without the duckdb feature");
        }

        if let Some(bq) = &config.bigquery {
            #[cfg(feature = "bigquery")]
            {
                writer = writer.with_sink(Arc::new(bigquery::BigQuerySink::new(bq.clone())));
            }
            #[cfg(not(feature = "bigquery"))]
            warn!(project = %bq.project_id, "BQ_PROJECT_ID set but built without the bigquery feature");
        }

        if let Some(template) = &config.parquet_path {
            writer = writer.with_sink(Arc::new(ParquetSink::new(
                PathTemplate::new(template.clone()),
                config.tenancy.clone(),
            )));
        }

        if let Some(template) = &config.json_path {
            writer = writer.with_sink(Arc::new(JsonLinesSink::new(
                PathTemplate::new(template.clone()),
                config.tenancy.clone(),
            )));
        }

        writer
    }

    /// Names of the registered sinks, in priority order
    pub fn sink_names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|s| s.sink.name()).collect()
    }

    pub fn sink_count(&self) -> usize {
        self.slots.len()
    }

    /// Write `tag`'s pending rows to every available sink, then clear them
    ///
    /// Sink failures are logged and reported, never returned.
    pub async fn flush(&self, buffer: &RowBuffer, tag: &str) -> FlushReport {
        let mut report = FlushReport {
            tag: tag.to_string(),
            ..Default::default()
        };

        let Some(drained) = buffer.take(tag) else {
            debug!(tag = %tag, "flush of a tag that was never stored");
            return report;
        };
        if drained.rows.is_empty() {
            debug!(tag = %tag, "nothing pending, skipping flush");
            return report;
        }

        let batch = Batch {
            tag: tag.to_string(),
            schema: drained.schema,
            rows: drained.rows,
        };
        report.rows = batch.rows.len();

        for slot in &self.slots {
            let sink = slot.sink.as_ref();
            if !sink.is_available() {
                debug!(sink = sink.name(), tag = %tag, "sink unavailable, skipping");
                continue;
            }

            let result = match slot.namespace.ensure(sink).await {
                Ok(()) => sink.replace(&batch).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    info!(sink = sink.name(), tag = %tag, rows = report.rows, "dataset replaced");
                    metrics::try_record_sink_write(sink.name(), true);
                    report.written.push(sink.name());
                }
                Err(e) => {
                    error!(sink = sink.name(), tag = %tag, error = %e, "sink write failed");
                    metrics::try_record_sink_write(sink.name(), false);
                    report.failed.push((sink.name(), e.to_string()));
                }
            }
        }

        report
    }

    /// Release every sink's connections
    pub async fn shutdown(&self) {
        for slot in &self.slots {
            if let Err(e) = slot.sink.shutdown().await {
                warn!(sink = slot.sink.name(), error = %e, "sink shutdown failed");
            }
        }
    }
}

impl Default for SinkWriter {
    fn default() -> Self {
        Self::new()
    }
}
