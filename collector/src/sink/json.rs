//! JSON-lines export
//!
//! One JSON object per row, keys in declared column order, nulls kept.

use super::{Batch, PathTemplate, Sink};
use crate::error::SinkError;
use crate::schema::{Row, Schema};
use async_trait::async_trait;
use chrono::Utc;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::path::Path;
use tracing::info;

pub struct JsonLinesSink {
    template: PathTemplate,
    tenancy: String,
}

impl JsonLinesSink {
    pub fn new(template: PathTemplate, tenancy: impl Into<String>) -> Self {
        Self {
            template,
            tenancy: tenancy.into(),
        }
    }
}

/// A row serialized in its schema's column order
struct Ordered<'a> {
    schema: &'a Schema,
    row: &'a Row,
}

impl Serialize for Ordered<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let columns = self.schema.columns();
        let mut map = serializer.serialize_map(Some(columns.len()))?;
        for column in columns {
            map.serialize_entry(&column.name, self.row.value(&column.name))?;
        }
        map.end()
    }
}

/// Encode rows as newline-terminated JSON objects
pub(crate) fn encode_lines(schema: &Schema, rows: &[Row]) -> Result<Vec<u8>, SinkError> {
    let mut out = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut out, &Ordered { schema, row })
            .map_err(|e| SinkError::Encode(e.to_string()))?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Create the parent directory of an export path
pub(crate) async fn ensure_parent(path: &Path) -> Result<(), SinkError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

#[async_trait]
impl Sink for JsonLinesSink {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn replace(&self, batch: &Batch) -> Result<(), SinkError> {
        let path = self.template.render(&batch.tag, &self.tenancy, Utc::now());
        let bytes = encode_lines(&batch.schema, &batch.rows)?;
        ensure_parent(&path).await?;
        tokio::fs::write(&path, bytes).await?;
        info!(path = %path.display(), rows = batch.rows.len(), "json export written");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::buffer::RowBuffer;
    use crate::schema::{ColumnType, Value};

    fn batch(buffer: &RowBuffer, names: &[&str]) -> Batch {
        let schema = Schema::new("hosts")
            .column("name", ColumnType::Text)
            .column("open", ColumnType::Boolean);
        let rows = names
            .iter()
            .map(|n| Row::new().with("name", *n).with("open", Value::Null))
            .collect();
        buffer.store(&schema, rows).unwrap();
        let drained = buffer.take("hosts").unwrap();
        Batch {
            tag: "hosts".into(),
            schema: drained.schema,
            rows: drained.rows,
        }
    }

    #[tokio::test]
    async fn test_writes_one_object_per_line_in_column_order() {
        let dir = tempfile::tempdir().unwrap();
        let template = format!("{}/$TENANCY/$TAG.jsonl", dir.path().display());
        let sink = JsonLinesSink::new(PathTemplate::new(template), "acme");
        let buffer = RowBuffer::new("acme");

        sink.replace(&batch(&buffer, &["a", "b"])).await.unwrap();

        let text = std::fs::read_to_string(dir.path().join("acme/hosts.jsonl")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(r#"{"name":"a","open":null,"tenancy":"acme","upload_timestamp":""#));
        let parsed: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed["name"], "b");
    }

    #[tokio::test]
    async fn test_replace_overwrites_previous_export() {
        let dir = tempfile::tempdir().unwrap();
        let template = format!("{}/$TAG.jsonl", dir.path().display());
        let sink = JsonLinesSink::new(PathTemplate::new(template), "t");
        let buffer = RowBuffer::new("t");

        sink.replace(&batch(&buffer, &["a", "b", "c"])).await.unwrap();
        sink.replace(&batch(&buffer, &["d"])).await.unwrap();

        let text = std::fs::read_to_string(dir.path().join("hosts.jsonl")).unwrap();
        assert_eq!(text.lines().count(), 1);
    }
}
