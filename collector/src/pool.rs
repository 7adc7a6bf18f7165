//! Fixed-size worker pool for per-item fan-out inside a plugin
//!
//! Items are fed through a bounded queue to `workers` tasks. Each item gets
//! its own result, returned in input order. A worker that panics on an item
//! reports [`PluginError::Panicked`] for that item and keeps going.

use crate::error::PluginError;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// Default queue depth per worker
const QUEUE_PER_WORKER: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
    queue_depth: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            queue_depth: workers * QUEUE_PER_WORKER,
        }
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `task` over every item, at most `workers` at a time
    pub async fn run<I, T, F, Fut>(&self, items: Vec<I>, task: F) -> Vec<Result<T, PluginError>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PluginError>> + Send + 'static,
    {
        let total = items.len();
        if total == 0 {
            return Vec::new();
        }

        let (queue_tx, queue_rx) = mpsc::channel::<(usize, I)>(self.queue_depth);
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let task = Arc::new(task);

        let mut handles = Vec::with_capacity(self.workers.min(total));
        for worker in 0..self.workers.min(total) {
            let queue_rx = Arc::clone(&queue_rx);
            let result_tx = result_tx.clone();
            let task = Arc::clone(&task);
            handles.push(tokio::spawn(async move {
                loop {
                    let next = queue_rx.lock().await.recv().await;
                    let Some((index, item)) = next else { break };
                    let result = match AssertUnwindSafe(task(item)).catch_unwind().await {
                        Ok(result) => result,
                        Err(payload) => {
                            let message = panic_message(payload.as_ref());
                            warn!(worker, index, panic = %message, "worker task panicked");
                            Err(PluginError::Panicked(message))
                        }
                    };
                    if result_tx.send((index, result)).is_err() {
                        break;
                    }
                }
                debug!(worker, "worker finished");
            }));
        }
        drop(result_tx);

        for (index, item) in items.into_iter().enumerate() {
            if queue_tx.send((index, item)).await.is_err() {
                break;
            }
        }
        drop(queue_tx);

        let mut slots: Vec<Option<Result<T, PluginError>>> = (0..total).map(|_| None).collect();
        while let Some((index, result)) = result_rx.recv().await {
            slots[index] = Some(result);
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker join failed");
            }
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| Err(PluginError::Task("item was never processed".into())))
            })
            .collect()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
