//! Per-dataset row buffer
//!
//! Rows accumulate here between a plugin's fetches and its flush. Each tag
//! keeps its ordered rows plus a cumulative counter for the whole run; the
//! counter survives flushes and is what decides whether a dataset still
//! needs its blank sentinel row.

use crate::error::BufferError;
use crate::metrics;
use crate::schema::{Row, Schema, TENANCY_COLUMN, UPLOAD_TIMESTAMP_COLUMN, Value};
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info};

/// Rows waiting for one dataset
struct TagBuffer {
    schema: Schema,
    rows: Vec<Row>,
    /// Rows stored for this tag over the whole run
    total: u64,
}

/// Rows and schema drained from a tag for flushing
#[derive(Debug, Clone)]
pub struct Drained {
    /// Declared columns plus the stamped columns
    pub schema: Schema,
    pub rows: Vec<Row>,
}

/// Thread-safe, run-scoped row buffer
///
/// Every stored row is stamped with the tenancy and with the upload
/// timestamp fixed when the buffer was created.
pub struct RowBuffer {
    tenancy: String,
    upload_timestamp: DateTime<Utc>,
    datasets: Mutex<HashMap<String, TagBuffer>>,
}

impl RowBuffer {
    /// Create a buffer stamping rows with `tenancy` and the current time
    pub fn new(tenancy: impl Into<String>) -> Self {
        Self::with_timestamp(tenancy, Utc::now())
    }

    /// Create a buffer with an explicit upload timestamp
    pub fn with_timestamp(tenancy: impl Into<String>, upload_timestamp: DateTime<Utc>) -> Self {
        Self {
            tenancy: tenancy.into(),
            // sinks store microseconds
            upload_timestamp: upload_timestamp.trunc_subsecs(6),
            datasets: Mutex::new(HashMap::new()),
        }
    }

    pub fn tenancy(&self) -> &str {
        &self.tenancy
    }

    pub fn upload_timestamp(&self) -> DateTime<Utc> {
        self.upload_timestamp
    }

    /// Validate, stamp and append rows for `schema`'s tag
    ///
    /// The whole call is rejected if any row carries an undeclared column or
    /// a value whose type disagrees with its column. Declared columns a row
    /// omits are stored as `Null`. Returns the number of rows appended.
    pub fn store(&self, schema: &Schema, rows: Vec<Row>) -> Result<u64, BufferError> {
        let tag = schema.tag();
        if rows.is_empty() {
            debug!(tag = %tag, "store called with no rows");
            return Ok(0);
        }

        validate_schema(schema)?;
        let stamped: Vec<Row> = rows
            .into_iter()
            .map(|row| self.conform(schema, row))
            .collect::<Result<_, _>>()?;
        let count = stamped.len() as u64;

        let mut datasets = self.datasets.lock();
        let entry = datasets.entry(tag.to_string()).or_insert_with(|| TagBuffer {
            schema: schema.clone(),
            rows: Vec::new(),
            total: 0,
        });
        if entry.schema != *schema {
            return Err(BufferError::SchemaChanged {
                tag: tag.to_string(),
            });
        }
        entry.rows.extend(stamped);
        entry.total += count;
        let pending = entry.rows.len();
        drop(datasets);

        metrics::try_record_rows_stored(tag, count);
        info!(tag = %tag, rows = count, pending, "stored rows");
        Ok(count)
    }

    /// Drain a tag's pending rows, leaving the entry (and its counter) in place
    ///
    /// Returns `None` when the tag was never stored.
    pub fn take(&self, tag: &str) -> Option<Drained> {
        let mut datasets = self.datasets.lock();
        let entry = datasets.get_mut(tag)?;
        Some(Drained {
            schema: entry.schema.stamped(),
            rows: std::mem::take(&mut entry.rows),
        })
    }

    /// Rows stored for `tag` over the whole run
    pub fn total_rows(&self, tag: &str) -> u64 {
        self.datasets.lock().get(tag).map(|e| e.total).unwrap_or(0)
    }

    /// Rows waiting for the next flush
    pub fn pending(&self, tag: &str) -> usize {
        self.datasets.lock().get(tag).map(|e| e.rows.len()).unwrap_or(0)
    }

    /// Tags that have been stored at least once, sorted
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.datasets.lock().keys().cloned().collect();
        tags.sort();
        tags
    }

    fn conform(&self, schema: &Schema, row: Row) -> Result<Row, BufferError> {
        let tag = schema.tag();
        let mut values = row.into_values();

        if let Some(unknown) = values.keys().find(|k| schema.column_type(k).is_none()) {
            return Err(BufferError::UnknownColumn {
                tag: tag.to_string(),
                column: unknown.clone(),
            });
        }

        let mut out = Row::new();
        for column in schema.columns() {
            let value = values.remove(&column.name).unwrap_or(Value::Null);
            if !value.fits(column.kind) {
                return Err(BufferError::TypeMismatch {
                    tag: tag.to_string(),
                    column: column.name.clone(),
                    expected: column.kind.as_str(),
                    found: value.type_name(),
                });
            }
            out.set(column.name.clone(), value.coerce(column.kind));
        }
        out.set(TENANCY_COLUMN, self.tenancy.as_str());
        out.set(UPLOAD_TIMESTAMP_COLUMN, self.upload_timestamp);
        Ok(out)
    }
}

fn validate_schema(schema: &Schema) -> Result<(), BufferError> {
    for reserved in [TENANCY_COLUMN, UPLOAD_TIMESTAMP_COLUMN] {
        if schema.column_type(reserved).is_some() {
            return Err(BufferError::ReservedColumn {
                tag: schema.tag().to_string(),
                column: reserved.to_string(),
            });
        }
    }
    Ok(())
}
