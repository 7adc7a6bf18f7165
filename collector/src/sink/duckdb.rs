//! DuckDB sink (feature `duckdb`)
//!
//! Same replace semantics as the PostgreSQL sink against an embedded
//! database file. The connection is opened on first use and all work runs on
//! the blocking pool.

use super::postgres::{chunk_size, quote_ident};
use super::{Batch, Sink};
use crate::config::DuckDbConfig;
use crate::error::SinkError;
use crate::schema::{ColumnType, Row, Schema, Value};
use async_trait::async_trait;
use duckdb::Connection;
use duckdb::types::{TimeUnit, Value as DuckValue};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

pub struct DuckDbSink {
    config: DuckDbConfig,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl DuckDbSink {
    pub fn new(config: DuckDbConfig) -> Self {
        Self {
            config,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Run `f` against the (lazily opened) connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, SinkError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, SinkError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let file = self.config.file.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            if guard.is_none() {
                if let Some(parent) = file.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)?;
                }
                let opened = Connection::open(&file)
                    .map_err(|e| SinkError::Connection(format!("open {}: {e}", file.display())))?;
                info!(file = %file.display(), "duckdb opened");
                *guard = Some(opened);
            }
            match guard.as_mut() {
                Some(conn) => f(conn),
                None => Err(SinkError::Connection("duckdb connection missing".into())),
            }
        })
        .await
        .map_err(|e| SinkError::Write(format!("duckdb task failed: {e}")))?
    }
}

#[async_trait]
impl Sink for DuckDbSink {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    async fn create_namespace(&self) -> Result<(), SinkError> {
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.config.schema));
        self.with_conn(move |conn| {
            conn.execute_batch(&sql)
                .map_err(|e| SinkError::Schema(e.to_string()))
        })
        .await
    }

    async fn replace(&self, batch: &Batch) -> Result<(), SinkError> {
        let table = format!(
            "{}.{}",
            quote_ident(&self.config.schema),
            quote_ident(&batch.tag)
        );
        let batch = batch.clone();
        self.with_conn(move |conn| replace_table(conn, &table, &batch))
            .await
    }

    async fn shutdown(&self) -> Result<(), SinkError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            if let Some(conn) = conn.lock().take() {
                conn.close()
                    .map_err(|(_, e)| SinkError::Connection(format!("close failed: {e}")))?;
                info!("duckdb closed");
            }
            Ok(())
        })
        .await
        .map_err(|e| SinkError::Connection(format!("duckdb task failed: {e}")))?
    }
}

fn sql_type(kind: ColumnType) -> &'static str {
    match kind {
        ColumnType::Text => "VARCHAR",
        ColumnType::Integer => "BIGINT",
        ColumnType::Float => "DOUBLE",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Timestamp => "TIMESTAMP",
    }
}

fn replace_table(conn: &mut Connection, table: &str, batch: &Batch) -> Result<(), SinkError> {
    let write = |e: duckdb::Error| SinkError::Write(e.to_string());
    let tx = conn.transaction().map_err(write)?;

    tx.execute_batch(&format!("DROP TABLE IF EXISTS {table}"))
        .map_err(write)?;
    tx.execute_batch(&create_table_sql(table, &batch.schema))
        .map_err(write)?;

    for chunk in batch.rows.chunks(chunk_size(batch.schema.columns().len())) {
        let sql = insert_sql(table, &batch.schema, chunk.len());
        let values = bind_values(&batch.schema, chunk);
        tx.execute(&sql, duckdb::params_from_iter(values.iter()))
            .map_err(write)?;
    }

    tx.commit().map_err(write)
}

fn create_table_sql(table: &str, schema: &Schema) -> String {
    let columns: Vec<String> = schema
        .columns()
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), sql_type(c.kind)))
        .collect();
    format!("CREATE TABLE {table} ({})", columns.join(", "))
}

fn insert_sql(table: &str, schema: &Schema, rows: usize) -> String {
    let names: Vec<String> = schema.columns().iter().map(|c| quote_ident(&c.name)).collect();
    let row = format!("({})", vec!["?"; names.len()].join(", "));
    format!(
        "INSERT INTO {table} ({}) VALUES {}",
        names.join(", "),
        vec![row; rows].join(", ")
    )
}

fn bind_values(schema: &Schema, rows: &[Row]) -> Vec<DuckValue> {
    rows.iter()
        .flat_map(|row| {
            schema
                .columns()
                .iter()
                .map(move |c| to_duck(row.value(&c.name)))
        })
        .collect()
}

fn to_duck(value: &Value) -> DuckValue {
    match value {
        Value::Null => DuckValue::Null,
        Value::Bool(b) => DuckValue::Boolean(*b),
        Value::Int(i) => DuckValue::BigInt(*i),
        Value::Float(f) => DuckValue::Double(*f),
        Value::Text(s) => DuckValue::Text(s.clone()),
        Value::Timestamp(ts) => DuckValue::Timestamp(TimeUnit::Microsecond, ts.timestamp_micros()),
    }
}
