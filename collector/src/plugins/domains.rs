//! Web posture checks for a list of domains
//!
//! Four live probes per domain, run on the worker pool: plain HTTP answers,
//! HTTPS answers, HTTP permanently redirects to HTTPS, and the certificate
//! validates.

use super::{Record, blank, store};
use crate::context::EngineContext;
use crate::error::PluginError;
use crate::gate::{GateDecision, Requirements};
use crate::pool::WorkerPool;
use crate::registry::Plugin;
use crate::schema::{ColumnType, Row, Schema};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, redirect};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const SCAN_WORKERS: usize = 4;

pub struct Domains;

/// Check names, in the order they are reported
pub const CHECKS: [&str; 4] = [
    "port_80",
    "port_443",
    "redirect_80_to_443",
    "ssl_certificate_valid",
];

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScanResult {
    pub domain: Option<String>,
    pub test: Option<String>,
    pub result: bool,
}

impl Record for ScanResult {
    fn schema() -> Schema {
        Schema::new("domain_scan_results")
            .column("domain", ColumnType::Text)
            .column("test", ColumnType::Text)
            .column("result", ColumnType::Boolean)
    }

    fn to_row(&self) -> Row {
        Row::new()
            .with("domain", self.domain.clone())
            .with("test", self.test.clone())
            .with("result", self.result)
    }
}

/// Clients for the probes: one following redirects, one not
#[derive(Clone)]
struct Probes {
    follow: Client,
    direct: Client,
}

impl Probes {
    fn new() -> Result<Self, PluginError> {
        let build = |policy| {
            Client::builder()
                .timeout(PROBE_TIMEOUT)
                .redirect(policy)
                .build()
                .map_err(|e| PluginError::Failed(format!("failed to build HTTP client: {e}")))
        };
        Ok(Self {
            follow: build(redirect::Policy::default())?,
            direct: build(redirect::Policy::none())?,
        })
    }

    async fn answers_ok(&self, url: &str) -> bool {
        match self.follow.get(url).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                debug!(url, error = %e, "probe failed");
                false
            }
        }
    }

    async fn redirects_to_https(&self, url: &str) -> bool {
        match self.direct.get(url).send().await {
            Ok(response) => {
                response.status() == StatusCode::MOVED_PERMANENTLY
                    && response
                        .headers()
                        .get(reqwest::header::LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|l| l.starts_with("https://"))
            }
            Err(e) => {
                debug!(url, error = %e, "probe failed");
                false
            }
        }
    }

    /// Results for `domain` in [`CHECKS`] order
    async fn scan(&self, domain: String) -> Vec<ScanResult> {
        let http = format!("http://{domain}");
        let https = format!("https://{domain}");
        // any TLS failure, including an invalid certificate, fails the request
        let tls_ok = self.answers_ok(&https).await;
        let outcomes = [
            self.answers_ok(&http).await,
            tls_ok,
            self.redirects_to_https(&http).await,
            tls_ok,
        ];
        CHECKS
            .iter()
            .zip(outcomes)
            .map(|(test, result)| ScanResult {
                domain: Some(domain.clone()),
                test: Some((*test).to_string()),
                result,
            })
            .collect()
    }
}

/// Domains from a comma separated list, trimmed, empties dropped
pub(crate) fn parse_domains(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(String::from)
        .collect()
}

#[async_trait]
impl Plugin for Domains {
    fn id(&self) -> &'static str {
        "domains"
    }

    async fn run(&self, ctx: &EngineContext) -> Result<(), PluginError> {
        let GateDecision::Open(gate) = ctx.env_check(&Requirements::new().require("DOMAINS")) else {
            return blank::<ScanResult>(ctx).await;
        };

        let domains = parse_domains(gate.get("DOMAINS"));
        let probes = Probes::new()?;
        info!(plugin = "domains", domains = domains.len(), "scanning domains");

        let results = WorkerPool::new(SCAN_WORKERS)
            .run(domains.clone(), move |domain| {
                let probes = probes.clone();
                async move { Ok::<_, PluginError>(probes.scan(domain).await) }
            })
            .await;

        let mut rows = Vec::with_capacity(domains.len() * CHECKS.len());
        for (domain, result) in domains.iter().zip(results) {
            match result {
                Ok(found) => rows.extend(found),
                Err(e) => warn!(plugin = "domains", domain = %domain, error = %e, "scan failed"),
            }
        }

        store(ctx, &rows)?;
        ctx.flush("domain_scan_results").await;
        blank::<ScanResult>(ctx).await
    }
}
