//! Parquet export
//!
//! Columns map one to one onto Arrow types; timestamps are microsecond UTC.
//! Files are Snappy compressed and written in a single row group per flush.

use super::json::ensure_parent;
use super::{Batch, PathTemplate, Sink};
use crate::error::SinkError;
use crate::schema::{ColumnType, Row, Schema, Value};
use arrow_array::builder::{
    BooleanBuilder, Float64Builder, Int64Builder, StringBuilder, TimestampMicrosecondBuilder,
};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Schema as ArrowSchema, TimeUnit};
use async_trait::async_trait;
use chrono::Utc;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::sync::Arc;
use tracing::info;

const UTC: &str = "UTC";

pub struct ParquetSink {
    template: PathTemplate,
    tenancy: String,
}

impl ParquetSink {
    pub fn new(template: PathTemplate, tenancy: impl Into<String>) -> Self {
        Self {
            template,
            tenancy: tenancy.into(),
        }
    }
}

#[async_trait]
impl Sink for ParquetSink {
    fn name(&self) -> &'static str {
        "parquet"
    }

    async fn replace(&self, batch: &Batch) -> Result<(), SinkError> {
        let path = self.template.render(&batch.tag, &self.tenancy, Utc::now());
        let bytes = encode(&batch.schema, &batch.rows)?;
        ensure_parent(&path).await?;
        tokio::fs::write(&path, bytes).await?;
        info!(path = %path.display(), rows = batch.rows.len(), "parquet export written");
        Ok(())
    }
}

fn arrow_type(kind: ColumnType) -> DataType {
    match kind {
        ColumnType::Text => DataType::Utf8,
        ColumnType::Integer => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into())),
    }
}

fn arrow_schema(schema: &Schema) -> ArrowSchema {
    ArrowSchema::new(
        schema
            .columns()
            .iter()
            .map(|c| Field::new(&c.name, arrow_type(c.kind), true))
            .collect::<Vec<_>>(),
    )
}

fn build_array(rows: &[Row], column: &str, kind: ColumnType) -> ArrayRef {
    match kind {
        ColumnType::Text => {
            let mut builder = StringBuilder::with_capacity(rows.len(), rows.len() * 16);
            for row in rows {
                match row.value(column) {
                    Value::Text(s) => builder.append_value(s),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Integer => {
            let mut builder = Int64Builder::with_capacity(rows.len());
            for row in rows {
                match row.value(column) {
                    Value::Int(i) => builder.append_value(*i),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Float => {
            let mut builder = Float64Builder::with_capacity(rows.len());
            for row in rows {
                match row.value(column) {
                    Value::Float(f) => builder.append_value(*f),
                    Value::Int(i) => builder.append_value(*i as f64),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(rows.len());
            for row in rows {
                match row.value(column) {
                    Value::Bool(b) => builder.append_value(*b),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Timestamp => {
            let mut builder =
                TimestampMicrosecondBuilder::with_capacity(rows.len()).with_timezone(UTC);
            for row in rows {
                match row.value(column) {
                    Value::Timestamp(ts) => builder.append_value(ts.timestamp_micros()),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
    }
}

/// Encode rows into an in-memory Parquet file
pub(crate) fn encode(schema: &Schema, rows: &[Row]) -> Result<Vec<u8>, SinkError> {
    let arrow = Arc::new(arrow_schema(schema));
    let columns: Vec<ArrayRef> = schema
        .columns()
        .iter()
        .map(|c| build_array(rows, &c.name, c.kind))
        .collect();
    let record_batch = RecordBatch::try_new(Arc::clone(&arrow), columns)
        .map_err(|e| SinkError::Encode(e.to_string()))?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, arrow, Some(props))
        .map_err(|e| SinkError::Encode(e.to_string()))?;
    writer
        .write(&record_batch)
        .map_err(|e| SinkError::Encode(e.to_string()))?;
    writer.close().map_err(|e| SinkError::Encode(e.to_string()))?;
    Ok(buffer)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use arrow_array::{Array, Int64Array, StringArray, TimestampMicrosecondArray};
    use chrono::TimeZone;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn read_batches(path: &std::path::Path) -> Vec<RecordBatch> {
        let file = std::fs::File::open(path).unwrap();
        ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap()
            .map(|b| b.unwrap())
            .collect()
    }

    fn schema() -> Schema {
        Schema::new("hosts")
            .column("name", ColumnType::Text)
            .column("cves", ColumnType::Integer)
            .column("seen", ColumnType::Timestamp)
    }

    #[tokio::test]
    async fn test_round_trips_types_and_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let template = format!("{}/$YYYY/$TAG.parquet", dir.path().display());
        let sink = ParquetSink::new(PathTemplate::new(template), "t");
        let seen = Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap();
        let rows = vec![
            Row::new().with("name", "web-1").with("cves", 4_i64).with("seen", seen),
            Row::new().with("name", "web-2").with("cves", Value::Null).with("seen", Value::Null),
        ];
        let batch = Batch {
            tag: "hosts".into(),
            schema: schema(),
            rows,
        };

        sink.replace(&batch).await.unwrap();

        let year = Utc::now().format("%Y").to_string();
        let batches = read_batches(&dir.path().join(year).join("hosts.parquet"));
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 2);

        let first = &batches[0];
        let names = first.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(names.value(1), "web-2");
        let cves = first.column(1).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(cves.value(0), 4);
        assert!(cves.is_null(1));
        let ts = first
            .column(2)
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .unwrap();
        assert_eq!(ts.value(0), seen.timestamp_micros());
        assert!(ts.is_null(1));
    }

    #[test]
    fn test_schema_maps_timestamp_to_utc_micros() {
        let arrow = arrow_schema(&schema());
        assert_eq!(
            arrow.field(2).data_type(),
            &DataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into()))
        );
        assert!(arrow.field(0).is_nullable());
    }
}
