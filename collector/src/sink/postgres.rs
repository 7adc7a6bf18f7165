//! PostgreSQL sink
//!
//! Each dataset is a table in the configured schema. A replace runs in one
//! transaction: drop the table, recreate it from the declared column types,
//! then insert the rows in parameterized multi-row chunks. Readers see
//! either the previous table or the new one, never a partial load.

use super::{Batch, Sink};
use crate::config::PostgresConfig;
use crate::error::SinkError;
use crate::schema::{ColumnType, Row, Schema, Value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_postgres::NoTls;
use tokio_postgres::types::ToSql;
use tracing::{debug, info};

/// Rows per INSERT statement
pub const CHUNK_ROWS: usize = 1000;
/// Bind parameters PostgreSQL accepts in one statement
const MAX_BIND_PARAMS: usize = 65_535;
const POOL_SIZE: usize = 4;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type Param = Box<dyn ToSql + Sync + Send>;

pub struct PostgresSink {
    config: PostgresConfig,
    pool: OnceCell<Pool>,
}

impl PostgresSink {
    /// Create the sink; no connection is made until the first write
    pub fn new(config: PostgresConfig) -> Self {
        Self {
            config,
            pool: OnceCell::new(),
        }
    }

    async fn pool(&self) -> Result<&Pool, SinkError> {
        self.pool
            .get_or_try_init(|| async {
                let mut pg = tokio_postgres::Config::new();
                pg.user(&self.config.username)
                    .password(&self.config.password)
                    .host(&self.config.host)
                    .port(self.config.port)
                    .dbname(&self.config.database)
                    .connect_timeout(CONNECT_TIMEOUT);

                let manager = Manager::from_config(
                    pg,
                    NoTls,
                    ManagerConfig {
                        recycling_method: RecyclingMethod::Fast,
                    },
                );
                let pool = Pool::builder(manager)
                    .max_size(POOL_SIZE)
                    .build()
                    .map_err(|e| SinkError::Connection(format!("pool creation failed: {e}")))?;
                info!(
                    host = %self.config.host,
                    database = %self.config.database,
                    "postgres pool created"
                );
                Ok(pool)
            })
            .await
    }
}

#[async_trait]
impl Sink for PostgresSink {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn create_namespace(&self) -> Result<(), SinkError> {
        let client = self
            .pool()
            .await?
            .get()
            .await
            .map_err(|e| SinkError::Connection(format!("pool get failed: {e}")))?;
        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                quote_ident(&self.config.schema)
            ))
            .await
            .map_err(|e| SinkError::Schema(e.to_string()))
    }

    async fn replace(&self, batch: &Batch) -> Result<(), SinkError> {
        let mut client = self
            .pool()
            .await?
            .get()
            .await
            .map_err(|e| SinkError::Connection(format!("pool get failed: {e}")))?;

        let table = qualified(&self.config.schema, &batch.tag);
        let tx = client
            .transaction()
            .await
            .map_err(|e| SinkError::Write(format!("begin failed: {e}")))?;

        tx.batch_execute(&format!("DROP TABLE IF EXISTS {table}"))
            .await
            .map_err(|e| SinkError::Write(format!("drop failed: {e}")))?;
        tx.batch_execute(&create_table_sql(&table, &batch.schema))
            .await
            .map_err(|e| SinkError::Write(format!("create failed: {e}")))?;

        let columns = batch.schema.columns().len();
        for chunk in batch.rows.chunks(chunk_size(columns)) {
            let sql = insert_sql(&table, &batch.schema, chunk.len());
            let params = bind_params(&batch.schema, chunk);
            let refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p.as_ref() as _).collect();
            tx.execute(&sql, &refs)
                .await
                .map_err(|e| SinkError::Write(format!("insert failed: {e}")))?;
            debug!(table = %table, rows = chunk.len(), "chunk inserted");
        }

        tx.commit()
            .await
            .map_err(|e| SinkError::Write(format!("commit failed: {e}")))
    }

    async fn shutdown(&self) -> Result<(), SinkError> {
        if let Some(pool) = self.pool.get() {
            pool.close();
            info!("postgres pool closed");
        }
        Ok(())
    }
}

/// Escape a SQL identifier by doubling embedded double-quotes
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

fn sql_type(kind: ColumnType) -> &'static str {
    match kind {
        ColumnType::Text => "TEXT",
        ColumnType::Integer => "BIGINT",
        ColumnType::Float => "DOUBLE PRECISION",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Timestamp => "TIMESTAMPTZ",
    }
}

/// Rows per statement for a table of `columns` columns
pub(crate) fn chunk_size(columns: usize) -> usize {
    CHUNK_ROWS.min(MAX_BIND_PARAMS / columns.max(1)).max(1)
}

pub(crate) fn create_table_sql(table: &str, schema: &Schema) -> String {
    let columns: Vec<String> = schema
        .columns()
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), sql_type(c.kind)))
        .collect();
    format!("CREATE TABLE {table} ({})", columns.join(", "))
}

pub(crate) fn insert_sql(table: &str, schema: &Schema, rows: usize) -> String {
    let names: Vec<String> = schema.columns().iter().map(|c| quote_ident(&c.name)).collect();
    let width = names.len();
    let placeholders: Vec<String> = (0..rows)
        .map(|r| {
            let params: Vec<String> = (1..=width).map(|c| format!("${}", r * width + c)).collect();
            format!("({})", params.join(", "))
        })
        .collect();
    format!(
        "INSERT INTO {table} ({}) VALUES {}",
        names.join(", "),
        placeholders.join(", ")
    )
}

fn bind_params(schema: &Schema, rows: &[Row]) -> Vec<Param> {
    let mut params: Vec<Param> = Vec::with_capacity(rows.len() * schema.columns().len());
    for row in rows {
        for column in schema.columns() {
            params.push(to_param(row.value(&column.name), column.kind));
        }
    }
    params
}

/// Typed parameter; nulls keep the column's type
fn to_param(value: &Value, kind: ColumnType) -> Param {
    match kind {
        ColumnType::Text => Box::new(match value {
            Value::Text(s) => Some(s.clone()),
            _ => None,
        }),
        ColumnType::Integer => Box::new(match value {
            Value::Int(i) => Some(*i),
            _ => None,
        }),
        ColumnType::Float => Box::new(match value {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }),
        ColumnType::Boolean => Box::new(match value {
            Value::Bool(b) => Some(*b),
            _ => None,
        }),
        ColumnType::Timestamp => Box::new(match value {
            Value::Timestamp(ts) => Some(*ts),
            _ => None::<DateTime<Utc>>,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new("okta_users")
            .column("id", ColumnType::Text)
            .column("logins", ColumnType::Integer)
            .stamped()
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("public"), "\"public\"");
        assert_eq!(quote_ident("my\"schema"), "\"my\"\"schema\"");
    }

    #[test]
    fn test_create_table_maps_types() {
        let sql = create_table_sql(&qualified("public", "okta_users"), &schema());
        assert_eq!(
            sql,
            "CREATE TABLE \"public\".\"okta_users\" (\"id\" TEXT, \"logins\" BIGINT, \
             \"tenancy\" TEXT, \"upload_timestamp\" TIMESTAMPTZ)"
        );
    }

    #[test]
    fn test_insert_placeholders_numbered_per_row() {
        let sql = insert_sql("t", &Schema::new("t").column("a", ColumnType::Text).column("b", ColumnType::Text), 2);
        assert_eq!(sql, "INSERT INTO t (\"a\", \"b\") VALUES ($1, $2), ($3, $4)");
    }

    #[test]
    fn test_chunk_size_respects_bind_limit() {
        assert_eq!(chunk_size(4), 1000);
        assert_eq!(chunk_size(100), 655);
        assert_eq!(chunk_size(0), 1000);
        assert_eq!(chunk_size(100_000), 1);
    }

    #[test]
    fn test_bind_params_one_per_cell() {
        let rows = vec![
            Row::new().with("id", "a").with("logins", 3_i64),
            Row::new().with("id", Value::Null),
        ];
        assert_eq!(bind_params(&schema(), &rows).len(), 8);
    }

    #[tokio::test]
    async fn test_new_does_not_connect() {
        let sink = PostgresSink::new(PostgresConfig {
            username: "u".into(),
            password: "p".into(),
            host: "127.0.0.1".into(),
            port: 1,
            database: "d".into(),
            schema: "public".into(),
        });
        assert_eq!(sink.name(), "postgres");
        assert!(sink.pool.get().is_none());
        assert!(sink.shutdown().await.is_ok());
    }
}
