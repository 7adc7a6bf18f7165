//! Per-run engine context handed to every plugin
//!
//! Owns the environment snapshot, the row buffer, the sink writer and the
//! alerter for one collector run. Plugins reach the rest of the engine only
//! through this value.

use crate::alert::{Alerter, Severity};
use crate::buffer::RowBuffer;
use crate::config::Config;
use crate::error::{BufferError, CollectorError, Result};
use crate::fetch::Fetcher;
use crate::gate::{Environment, GateDecision, Requirements};
use crate::schema::{Row, Schema, normalize_tag};
use crate::sink::{FlushReport, SinkWriter};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

pub struct EngineContext {
    env: Environment,
    config: Config,
    buffer: RowBuffer,
    writer: SinkWriter,
    alerter: Alerter,
    client: Client,
}

impl EngineContext {
    /// Context with sinks and alert channels built from `config`
    pub fn new(env: Environment, config: Config) -> Result<Self> {
        let writer = SinkWriter::from_config(&config);
        let alerter = Alerter::from_config(config.tenancy.clone(), &config.alerts);
        Self::builder(config)
            .env(env)
            .writer(writer)
            .alerter(alerter)
            .build()
    }

    pub fn builder(config: Config) -> EngineContextBuilder {
        EngineContextBuilder {
            config,
            env: None,
            writer: None,
            alerter: None,
        }
    }

    /// Gate a plugin on its required variables
    pub fn env_check(&self, requirements: &Requirements) -> GateDecision {
        requirements.check(&self.env)
    }

    /// Buffer rows for `schema`'s dataset
    pub fn store(&self, schema: &Schema, rows: Vec<Row>) -> std::result::Result<u64, BufferError> {
        self.buffer.store(schema, rows)
    }

    /// Replace `tag` in every sink with its pending rows
    ///
    /// `tag` is normalized the same way [`Schema::new`] normalizes it.
    pub async fn flush(&self, tag: &str) -> FlushReport {
        self.writer.flush(&self.buffer, &normalize_tag(tag)).await
    }

    /// Materialize an empty dataset
    ///
    /// Only acts when nothing was stored under the schema's tag during this
    /// run: stores `sentinel` as the single row and flushes. Returns `None`
    /// when the dataset already has data.
    pub async fn write_blank(
        &self,
        schema: &Schema,
        sentinel: Row,
    ) -> std::result::Result<Option<FlushReport>, BufferError> {
        let tag = schema.tag();
        if self.buffer.total_rows(tag) > 0 {
            debug!(tag = %tag, "dataset has rows, blank not needed");
            return Ok(None);
        }
        self.buffer.store(schema, vec![sentinel])?;
        info!(tag = %tag, "writing blank dataset");
        Ok(Some(self.flush(tag).await))
    }

    /// Send a deduplicated alert
    pub async fn alert(&self, message: &str, severity: Severity) -> usize {
        self.alerter.send(message, severity).await
    }

    /// Fresh fetcher on the shared HTTP client
    pub fn fetcher(&self) -> Fetcher {
        Fetcher::new(self.client.clone())
    }

    pub fn http_client(&self) -> &Client {
        &self.client
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn buffer(&self) -> &RowBuffer {
        &self.buffer
    }

    pub fn alerter(&self) -> &Alerter {
        &self.alerter
    }

    pub fn writer(&self) -> &SinkWriter {
        &self.writer
    }

    /// Release sink connections
    pub async fn shutdown(&self) {
        self.writer.shutdown().await;
    }
}

/// Assembles an [`EngineContext`]; unset parts default to empty
pub struct EngineContextBuilder {
    config: Config,
    env: Option<Environment>,
    writer: Option<SinkWriter>,
    alerter: Option<Alerter>,
}

impl EngineContextBuilder {
    pub fn env(mut self, env: Environment) -> Self {
        self.env = Some(env);
        self
    }

    pub fn writer(mut self, writer: SinkWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn alerter(mut self, alerter: Alerter) -> Self {
        self.alerter = Some(alerter);
        self
    }

    pub fn build(self) -> Result<EngineContext> {
        let client = Client::builder()
            .timeout(self.config.http_timeout)
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| CollectorError::Config(format!("failed to build HTTP client: {e}")))?;

        let tenancy = self.config.tenancy.clone();
        Ok(EngineContext {
            env: self.env.unwrap_or_default(),
            buffer: RowBuffer::new(tenancy.clone()),
            writer: self.writer.unwrap_or_default(),
            alerter: self.alerter.unwrap_or_else(|| Alerter::new(tenancy)),
            config: self.config,
            client,
        })
    }
}
