//! One-time namespace bootstrap per sink

use super::Sink;
use crate::error::SinkError;
use tokio::sync::OnceCell;
use tracing::{error, info};

/// Runs a sink's `create_namespace` until it succeeds once
///
/// Concurrent callers wait on the same attempt. A failed attempt leaves the
/// guard unset so the next flush tries again.
#[derive(Debug, Default)]
pub struct SchemaEnsurer {
    created: OnceCell<()>,
}

impl SchemaEnsurer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ensure(&self, sink: &dyn Sink) -> Result<(), SinkError> {
        if self.created.initialized() {
            return Ok(());
        }
        self.created
            .get_or_try_init(|| async {
                match sink.create_namespace().await {
                    Ok(()) => {
                        info!(sink = sink.name(), "namespace ensured");
                        Ok(())
                    }
                    Err(e) => {
                        error!(sink = sink.name(), error = %e, "namespace bootstrap failed");
                        Err(e)
                    }
                }
            })
            .await
            .map(|_| ())
    }

    pub fn is_ensured(&self) -> bool {
        self.created.initialized()
    }
}
