//! Runs the selected plugins one after another
//!
//! Each plugin runs in its own task so that a panic is contained to that
//! plugin. Failures are logged, alerted and counted; the run always reaches
//! the end, releases the sinks and reports a single completion alert.

use crate::alert::Severity;
use crate::context::EngineContext;
use crate::metrics;
use crate::pool::panic_message;
use crate::registry::Plugin;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Result of one plugin
#[derive(Debug, Clone)]
pub struct PluginOutcome {
    pub id: &'static str,
    pub elapsed: Duration,
    /// `None` when the plugin completed
    pub error: Option<String>,
}

impl PluginOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a whole run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub outcomes: Vec<PluginOutcome>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn is_success(&self) -> bool {
        self.succeeded() == self.total()
    }

    /// Process exit code: 0 iff every plugin completed
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    pub fn completion_message(&self) -> String {
        format!(
            "Collector completed with {} / {} - elapsed time {} seconds",
            self.succeeded(),
            self.total(),
            self.elapsed.as_secs()
        )
    }

    /// Fixed-width per-plugin status table
    pub fn status_table(&self) -> String {
        let width = self
            .outcomes
            .iter()
            .map(|o| o.id.len())
            .max()
            .unwrap_or(0)
            .max("plugin".len());
        let mut table = format!("{:<width$}  {:<6}  {:>8}\n", "plugin", "status", "seconds");
        for outcome in &self.outcomes {
            let status = if outcome.succeeded() { "ok" } else { "FAILED" };
            let _ = writeln!(
                table,
                "{:<width$}  {:<6}  {:>8.1}",
                outcome.id,
                status,
                outcome.elapsed.as_secs_f64()
            );
        }
        table
    }
}

pub struct Runner {
    ctx: Arc<EngineContext>,
}

impl Runner {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Run every plugin in order, then shut the sinks down and alert
    pub async fn run(&self, plugins: Vec<Arc<dyn Plugin>>) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary::default();
        info!(plugins = plugins.len(), "collector run starting");

        for plugin in plugins {
            let outcome = self.run_one(plugin).await;
            metrics::try_record_plugin_run(outcome.id, outcome.succeeded());
            if let Some(err) = &outcome.error {
                error!(plugin = outcome.id, error = %err, "plugin failed");
                self.ctx
                    .alert(&format!("Error running source: {}\n{err}", outcome.id), Severity::Error)
                    .await;
            }
            summary.outcomes.push(outcome);
        }

        self.ctx.shutdown().await;
        summary.elapsed = started.elapsed();
        if let Some(m) = metrics::Metrics::get() {
            m.set_run_duration(summary.elapsed.as_secs_f64());
        }

        for line in summary.status_table().lines() {
            info!("{line}");
        }

        let severity = if summary.is_success() {
            Severity::Success
        } else {
            Severity::Error
        };
        self.ctx.alert(&summary.completion_message(), severity).await;
        info!(
            succeeded = summary.succeeded(),
            total = summary.total(),
            elapsed_secs = summary.elapsed.as_secs(),
            "collector run finished"
        );
        summary
    }

    async fn run_one(&self, plugin: Arc<dyn Plugin>) -> PluginOutcome {
        let id = plugin.id();
        let started = Instant::now();
        info!(plugin = id, "plugin starting");

        let ctx = Arc::clone(&self.ctx);
        let handle = tokio::spawn(async move { plugin.run(&ctx).await });
        let error = match handle.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) if e.is_panic() => Some(format!("panicked: {}", panic_message(e.into_panic().as_ref()))),
            Err(e) => Some(format!("task failed: {e}")),
        };

        let elapsed = started.elapsed();
        if error.is_none() {
            info!(plugin = id, elapsed_ms = elapsed.as_millis() as u64, "plugin completed");
        }
        PluginOutcome { id, elapsed, error }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::PluginError;
    use crate::registry::tests::Named;
    use crate::sink::SinkWriter;
    use crate::sink::tests::RecordingSink;
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;

    struct Failing;

    #[async_trait]
    impl Plugin for Failing {
        fn id(&self) -> &'static str {
            "failing"
        }

        async fn run(&self, _ctx: &EngineContext) -> Result<(), PluginError> {
            Err(PluginError::Failed("vendor returned garbage".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl Plugin for Panicking {
        fn id(&self) -> &'static str {
            "panicking"
        }

        async fn run(&self, _ctx: &EngineContext) -> Result<(), PluginError> {
            panic!("index out of bounds");
        }
    }

    fn runner(sink: Arc<RecordingSink>) -> Runner {
        let ctx = EngineContext::builder(Config::default())
            .writer(SinkWriter::new().with_sink(sink))
            .build()
            .unwrap();
        Runner::new(Arc::new(ctx))
    }

    #[tokio::test]
    async fn test_all_succeed_exit_zero_and_success_alert() {
        let sink = Arc::new(RecordingSink::new("mem"));
        let runner = runner(sink.clone());

        let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(Named("a")), Arc::new(Named("b"))];
        let summary = runner.run(plugins).await;

        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.succeeded(), 2);
        assert!(runner.context().alerter().was_sent(&summary.completion_message()));
        assert_eq!(sink.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_and_panic_are_isolated() {
        let sink = Arc::new(RecordingSink::new("mem"));
        let runner = runner(sink.clone());

        let plugins: Vec<Arc<dyn Plugin>> = vec![
            Arc::new(Failing),
            Arc::new(Panicking),
            Arc::new(Named("after")),
        ];
        let summary = runner.run(plugins).await;

        assert_eq!(summary.total(), 3);
        assert_eq!(summary.succeeded(), 1);
        assert_eq!(summary.exit_code(), 1);
        assert!(summary.outcomes[2].succeeded());

        let panic = summary.outcomes[1].error.as_deref().unwrap();
        assert!(panic.contains("index out of bounds"));

        let alerter = runner.context().alerter();
        assert!(alerter.was_sent("Error running source: failing\nvendor returned garbage"));
        assert!(summary.completion_message().starts_with("Collector completed with 1 / 3"));
        assert!(alerter.was_sent(&summary.completion_message()));
        assert_eq!(sink.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_status_table_lists_every_plugin() {
        let summary = RunSummary {
            outcomes: vec![
                PluginOutcome {
                    id: "okta",
                    elapsed: Duration::from_millis(1500),
                    error: None,
                },
                PluginOutcome {
                    id: "azure_entra",
                    elapsed: Duration::from_secs(3),
                    error: Some("x".into()),
                },
            ],
            elapsed: Duration::from_secs(4),
        };
        let table = summary.status_table();
        assert_eq!(table.lines().count(), 3);
        assert!(table.contains("okta         ok"));
        assert!(table.contains("azure_entra  FAILED"));
        assert_eq!(
            summary.completion_message(),
            "Collector completed with 1 / 2 - elapsed time 4 seconds"
        );
    }

    #[tokio::test]
    async fn test_empty_run_is_success() {
        let runner = runner(Arc::new(RecordingSink::new("mem")));
        let summary = runner.run(Vec::new()).await;
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.completion_message(), "Collector completed with 0 / 0 - elapsed time 0 seconds");
    }
}
