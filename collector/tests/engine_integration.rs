//! End-to-end collection runs
//!
//! Real plugins against in-process vendor mocks, writing to a JSON-lines
//! export in a temp directory.

#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use posture_collector::alert::{AlertChannel, Alerter};
use posture_collector::config::Config;
use posture_collector::context::EngineContext;
use posture_collector::error::{AlertError, SinkError};
use posture_collector::gate::Environment;
use posture_collector::registry::PluginRegistry;
use posture_collector::runner::Runner;
use posture_collector::sink::{Batch, JsonLinesSink, PathTemplate, Sink, SinkWriter};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpListener;

// ============================================================================
// Vendor mocks
// ============================================================================

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    format!("http://{addr}")
}

fn authorized(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected)
}

/// Okta org with three users over two `Link` pages, one factor each
async fn okta_mock() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());

    let users = |State(base): State<String>,
                 headers: HeaderMap,
                 Query(query): Query<HashMap<String, String>>| async move {
        if !authorized(&headers, "SSWS okta-token") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        match query.get("after").map(String::as_str) {
            None => (
                [("link", format!("<{base}/api/v1/users?after=u2>; rel=\"next\""))],
                Json(json!([
                    {"id": "u1", "status": "ACTIVE", "profile": {"login": "ann@acme.io"}},
                    {"id": "u2", "status": "SUSPENDED", "profile": {"login": "bob@acme.io"}}
                ])),
            )
                .into_response(),
            Some(_) => Json(json!([
                {"id": "u3", "status": "ACTIVE", "created": "2024-01-01T00:00:00.000Z"}
            ]))
            .into_response(),
        }
    };
    let factors = |Path(id): Path<String>| async move {
        Json(json!([{"id": format!("f-{id}"), "factorType": "push", "status": "ACTIVE"}]))
    };

    let app = Router::new()
        .route("/api/v1/users", get(users))
        .route("/api/v1/users/:id/factors", get(factors))
        .with_state(base.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    base
}

/// KnowBe4 enrollments: two pages of data, then an empty page
async fn knowbe4_mock() -> String {
    let app = Router::new().route(
        "/v1/training/enrollments",
        get(|Query(query): Query<HashMap<String, String>>| async move {
            let page: u32 = query.get("page").and_then(|p| p.parse().ok()).unwrap_or(0);
            let items = match page {
                1 => json!([
                    {"enrollment_id": 1, "status": "Passed", "user": {"email": "ann@acme.io"}},
                    {"enrollment_id": "2", "status": "In Progress"}
                ]),
                2 => json!([{"enrollment_id": 3, "policy_acknowledged": true}]),
                _ => json!([]),
            };
            Json(items)
        }),
    );
    serve(app).await
}

// ============================================================================
// Helpers
// ============================================================================

fn read_lines(path: &std::path::Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

/// Alert channel keeping every delivered text
#[derive(Default)]
struct Recorder {
    texts: Mutex<Vec<String>>,
}

#[async_trait]
impl AlertChannel for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    async fn deliver(&self, text: &str) -> Result<(), AlertError> {
        self.texts.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Sink that always fails
struct Broken;

#[async_trait]
impl Sink for Broken {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn replace(&self, _batch: &Batch) -> Result<(), SinkError> {
        Err(SinkError::Connection("refused".into()))
    }
}

fn config(tenancy: &str) -> Config {
    Config {
        tenancy: tenancy.to_string(),
        ..Config::default()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_full_run_writes_every_dataset() {
    let okta = okta_mock().await;
    let knowbe4 = knowbe4_mock().await;
    let dir = tempfile::tempdir().unwrap();

    let env = Environment::from_pairs([
        ("OKTA_DOMAIN", okta),
        ("OKTA_TOKEN", "okta-token".to_string()),
        ("KNOWBE4_TOKEN", "kb4".to_string()),
        ("KNOWBE4_ENDPOINT", format!("{knowbe4}/v1/training/enrollments")),
        // placeholder value keeps the domains plugin gated off
        ("DOMAINS", "CHANGE ME".to_string()),
    ]);
    let template = format!("{}/$TENANCY/$TAG.jsonl", dir.path().display());
    let recorder = Arc::new(Recorder::default());
    let ctx = EngineContext::builder(config("acme"))
        .env(env)
        .writer(
            SinkWriter::new()
                .with_sink(Arc::new(Broken))
                .with_sink(Arc::new(JsonLinesSink::new(PathTemplate::new(template), "acme"))),
        )
        .alerter(Alerter::new("acme").with_channel(recorder.clone()))
        .build()
        .unwrap();

    let filter = vec!["domains".to_string(), "knowbe4".to_string(), "okta".to_string()];
    let plugins = PluginRegistry::builtin().select(Some(filter.as_slice())).unwrap();
    let summary = Runner::new(Arc::new(ctx)).run(plugins).await;

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.succeeded(), 3);

    let out = dir.path().join("acme");
    let users = read_lines(&out.join("okta_users.jsonl"));
    assert_eq!(users.len(), 3);
    assert_eq!(users[0]["profile_login"], "ann@acme.io");
    assert_eq!(users[2]["created"], "2024-01-01T00:00:00.000000Z");
    assert_eq!(users[0]["tenancy"], "acme");

    let factors = read_lines(&out.join("okta_factors.jsonl"));
    assert_eq!(factors.len(), 3);
    let owners: Vec<&str> = factors.iter().map(|f| f["userid"].as_str().unwrap()).collect();
    assert_eq!(owners, vec!["u1", "u2", "u3"]);

    let enrollments = read_lines(&out.join("knowbe4_enrollments.jsonl"));
    assert_eq!(enrollments.len(), 3);
    assert_eq!(enrollments[1]["enrollment_id"], 2);
    assert_eq!(enrollments[2]["policy_acknowledged"], true);

    let scans = read_lines(&out.join("domain_scan_results.jsonl"));
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0]["domain"], Value::Null);
    assert_eq!(scans[0]["result"], false);

    let texts = recorder.texts.lock().unwrap();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with(":white_check_mark: - acme - Collector completed with 3 / 3"));
}

#[tokio::test]
async fn test_unconfigured_vendors_still_materialize_blank_datasets() {
    let dir = tempfile::tempdir().unwrap();
    let template = format!("{}/$TAG.jsonl", dir.path().display());
    let ctx = EngineContext::builder(config("t"))
        .writer(SinkWriter::new().with_sink(Arc::new(JsonLinesSink::new(PathTemplate::new(template), "t"))))
        .build()
        .unwrap();

    let plugins = PluginRegistry::builtin().select(None).unwrap();
    let summary = Runner::new(Arc::new(ctx)).run(plugins).await;

    assert_eq!(summary.exit_code(), 0);
    for tag in [
        "azure_entra_users",
        "azure_entra_users_signin",
        "azure_audit_logs",
        "domain_scan_results",
        "knowbe4_enrollments",
        "okta_users",
        "okta_factors",
    ] {
        let rows = read_lines(&dir.path().join(format!("{tag}.jsonl")));
        assert_eq!(rows.len(), 1, "{tag} should hold exactly the blank row");
        assert_eq!(rows[0]["tenancy"], "t");
    }
}

#[tokio::test]
async fn test_rejected_credentials_fall_back_to_blank() {
    let okta = okta_mock().await;
    let dir = tempfile::tempdir().unwrap();
    let template = format!("{}/$TAG.jsonl", dir.path().display());
    let ctx = EngineContext::builder(config("t"))
        .env(Environment::from_pairs([
            ("OKTA_DOMAIN", okta.as_str()),
            ("OKTA_TOKEN", "wrong"),
        ]))
        .writer(SinkWriter::new().with_sink(Arc::new(JsonLinesSink::new(PathTemplate::new(template), "t"))))
        .build()
        .unwrap();

    let filter = vec!["okta".to_string()];
    let plugins = PluginRegistry::builtin().select(Some(filter.as_slice())).unwrap();
    let summary = Runner::new(Arc::new(ctx)).run(plugins).await;

    assert_eq!(summary.exit_code(), 0);
    let users = read_lines(&dir.path().join("okta_users.jsonl"));
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["id"], Value::Null);
}
