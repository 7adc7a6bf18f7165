//! BigQuery sink (feature `bigquery`)
//!
//! The configured dataset is the namespace. Rows never go through the
//! streaming API: a replace loads them into a staging table with DML query
//! jobs, then swaps the staging table into place with a single
//! `CREATE OR REPLACE TABLE ... AS SELECT`, so readers see either the old
//! or the new dataset.

use super::{Batch, Sink};
use crate::config::BigQueryConfig;
use crate::error::SinkError;
use crate::schema::{ColumnType, Row, Schema, Value};
use async_trait::async_trait;
use gcp_bigquery_client::Client;
use gcp_bigquery_client::model::dataset::Dataset;
use gcp_bigquery_client::model::query_request::QueryRequest;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Rows per `INSERT` statement
const INSERT_CHUNK: usize = 500;
/// Statement length cap, below BigQuery's 1024K character query limit
const MAX_STATEMENT_BYTES: usize = 900 * 1024;
const STAGING_SUFFIX: &str = "__staging";

pub struct BigQuerySink {
    config: BigQueryConfig,
    client: OnceCell<Client>,
}

impl BigQuerySink {
    pub fn new(config: BigQueryConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Client, SinkError> {
        self.client
            .get_or_try_init(|| async {
                let client = match &self.config.credentials {
                    Some(path) => {
                        let key = gcp_bigquery_client::yup_oauth2::read_service_account_key(path)
                            .await
                            .map_err(|e| {
                                SinkError::Connection(format!(
                                    "read credentials {}: {e}",
                                    path.display()
                                ))
                            })?;
                        Client::from_service_account_key(key, false).await
                    }
                    None => Client::from_application_default_credentials().await,
                }
                .map_err(|e| SinkError::Connection(format!("bigquery client: {e}")))?;
                info!(project = %self.config.project_id, "bigquery client created");
                Ok(client)
            })
            .await
    }

    fn table_ref(&self, table: &str) -> String {
        quote_ident(&format!(
            "{}.{}.{table}",
            self.config.project_id, self.config.dataset
        ))
    }

    async fn run(&self, client: &Client, sql: String) -> Result<(), SinkError> {
        client
            .job()
            .query(&self.config.project_id, QueryRequest::new(sql))
            .await
            .map(|_| ())
            .map_err(|e| SinkError::Write(e.to_string()))
    }
}

#[async_trait]
impl Sink for BigQuerySink {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    async fn create_namespace(&self) -> Result<(), SinkError> {
        let client = self.client().await?;
        let project = &self.config.project_id;
        let dataset = &self.config.dataset;
        if client.dataset().get(project, dataset).await.is_ok() {
            return Ok(());
        }
        client
            .dataset()
            .create(Dataset::new(project, dataset))
            .await
            .map_err(|e| SinkError::Schema(format!("create dataset {dataset}: {e}")))?;
        info!(dataset = %dataset, "bigquery dataset created");
        Ok(())
    }

    async fn replace(&self, batch: &Batch) -> Result<(), SinkError> {
        let client = self.client().await?;
        let target = self.table_ref(&batch.tag);
        let staging = self.table_ref(&format!("{}{STAGING_SUFFIX}", batch.tag));

        self.run(client, create_table_sql(&staging, &batch.schema))
            .await
            .map_err(|e| SinkError::Write(format!("create staging for {}: {e}", batch.tag)))?;

        for (n, statement) in insert_statements(&staging, &batch.schema, &batch.rows)
            .into_iter()
            .enumerate()
        {
            self.run(client, statement)
                .await
                .map_err(|e| SinkError::Write(format!("insert {}: {e}", batch.tag)))?;
            debug!(table = %batch.tag, statement = n, "staging chunk loaded");
        }

        self.run(client, format!("CREATE OR REPLACE TABLE {target} AS SELECT * FROM {staging}"))
            .await
            .map_err(|e| SinkError::Write(format!("swap {}: {e}", batch.tag)))?;

        if let Err(e) = self.run(client, format!("DROP TABLE IF EXISTS {staging}")).await {
            warn!(table = %batch.tag, error = %e, "staging table not dropped");
        }
        Ok(())
    }
}

/// Backtick-quote a (possibly dotted) table path or column name
fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('\\', "\\\\").replace('`', "\\`"))
}

fn sql_type(kind: ColumnType) -> &'static str {
    match kind {
        ColumnType::Text => "STRING",
        ColumnType::Integer => "INT64",
        ColumnType::Float => "FLOAT64",
        ColumnType::Boolean => "BOOL",
        ColumnType::Timestamp => "TIMESTAMP",
    }
}

fn create_table_sql(table: &str, schema: &Schema) -> String {
    let columns: Vec<String> = schema
        .columns()
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), sql_type(c.kind)))
        .collect();
    format!("CREATE OR REPLACE TABLE {table} ({})", columns.join(", "))
}

/// GoogleSQL literal for one value
fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.is_nan() => "CAST('NaN' AS FLOAT64)".to_string(),
        Value::Float(f) if f.is_infinite() => {
            let sign = if *f > 0.0 { "" } else { "-" };
            format!("CAST('{sign}inf' AS FLOAT64)")
        }
        Value::Float(f) => format!("{f:?}"),
        // JSON string escapes are valid GoogleSQL double-quoted escapes
        Value::Text(s) => serde_json::Value::String(s.clone()).to_string(),
        Value::Timestamp(ts) => format!(
            "TIMESTAMP '{}'",
            ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
        ),
    }
}

fn row_tuple(schema: &Schema, row: &Row) -> String {
    let values: Vec<String> = schema
        .columns()
        .iter()
        .map(|c| literal(row.value(&c.name)))
        .collect();
    format!("({})", values.join(", "))
}

/// `INSERT` statements covering `rows`, split by row count and length
fn insert_statements(table: &str, schema: &Schema, rows: &[Row]) -> Vec<String> {
    let names: Vec<String> = schema.columns().iter().map(|c| quote_ident(&c.name)).collect();
    let head = format!("INSERT INTO {table} ({}) VALUES ", names.join(", "));

    let mut statements = Vec::new();
    let mut current = head.clone();
    let mut in_current = 0;
    for row in rows {
        let tuple = row_tuple(schema, row);
        if in_current > 0
            && (in_current == INSERT_CHUNK || current.len() + tuple.len() + 2 > MAX_STATEMENT_BYTES)
        {
            statements.push(std::mem::replace(&mut current, head.clone()));
            in_current = 0;
        }
        if in_current > 0 {
            current.push_str(", ");
        }
        current.push_str(&tuple);
        in_current += 1;
    }
    if in_current > 0 {
        statements.push(current);
    }
    statements
}
