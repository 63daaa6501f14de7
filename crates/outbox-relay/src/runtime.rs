//! Scheduled processor loops.
//!
//! ```text
//! ProcessorRuntime::run(shutdown)
//!   ├── worker 0: run() ─ sleep(fixed_delay) ─ run() ─ ...
//!   ├── worker 1: run() ─ sleep(fixed_delay) ─ run() ─ ...
//!   └── ...       (coordinated only through claim_batch)
//! ```

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::SchedulingConfig;
use crate::processor::OutboxProcessor;
use crate::publisher::OutboundPublisher;
use crate::store::OutboxStore;

/// Runs an [`OutboxProcessor`] on a fixed delay until shutdown.
///
/// # Shutdown Behavior
///
/// When the shutdown future completes:
/// 1. Workers stop starting new runs
/// 2. A run already in progress finishes (bounded by `run_timeout`)
/// 3. `run` returns once all workers stop, or after `shutdown_timeout`
///
/// # Example
///
/// ```ignore
/// use tokio::signal;
///
/// let processor = OutboxProcessor::new(store, publisher, OutboxConfig::from_env());
/// ProcessorRuntime::new(processor)
///     .run(async { signal::ctrl_c().await.ok(); })
///     .await;
/// ```
pub struct ProcessorRuntime<S, P> {
    processor: Arc<OutboxProcessor<S, P>>,
    scheduling: SchedulingConfig,
}

impl<S, P> ProcessorRuntime<S, P>
where
    S: OutboxStore,
    P: OutboundPublisher,
{
    /// Schedule `processor` according to its `scheduling` settings.
    pub fn new(processor: OutboxProcessor<S, P>) -> Self {
        let scheduling = processor.config().scheduling.clone();
        Self {
            processor: Arc::new(processor),
            scheduling,
        }
    }

    pub fn processor(&self) -> &OutboxProcessor<S, P> {
        &self.processor
    }

    /// Run the worker loops until `shutdown` completes.
    ///
    /// Returns immediately when scheduling is disabled.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        if !self.scheduling.enabled {
            info!(
                worker_id = %self.processor.worker_id(),
                "Outbox scheduling disabled, runtime not started"
            );
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_count = self.scheduling.workers.max(1);

        info!(
            worker_id = %self.processor.worker_id(),
            workers = worker_count,
            fixed_delay_ms = self.scheduling.fixed_delay.as_millis() as u64,
            "Outbox runtime starting"
        );

        let mut worker_handles = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let name = if worker_count == 1 {
                self.processor.worker_id().to_string()
            } else {
                format!("{}-{}", self.processor.worker_id(), i)
            };

            let worker = ProcessorWorker {
                processor: Arc::clone(&self.processor),
                scheduling: self.scheduling.clone(),
                name,
            };
            let worker_shutdown_rx = shutdown_rx.clone();
            worker_handles.push(tokio::spawn(async move {
                worker.run(worker_shutdown_rx).await;
            }));
        }

        shutdown.await;
        let _ = shutdown_tx.send(true);

        let shutdown_timeout = self.scheduling.shutdown_timeout;
        let all_workers = async {
            for handle in worker_handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Outbox worker task failed");
                }
            }
        };

        match tokio::time::timeout(shutdown_timeout, all_workers).await {
            Ok(()) => {
                info!(worker_id = %self.processor.worker_id(), "Outbox runtime stopped gracefully");
            }
            Err(_) => {
                warn!(
                    worker_id = %self.processor.worker_id(),
                    timeout_secs = shutdown_timeout.as_secs(),
                    "Shutdown timeout exceeded, forcing stop"
                );
            }
        }
    }
}

struct ProcessorWorker<S, P> {
    processor: Arc<OutboxProcessor<S, P>>,
    scheduling: SchedulingConfig,
    name: String,
}

impl<S, P> ProcessorWorker<S, P>
where
    S: OutboxStore,
    P: OutboundPublisher,
{
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.name, "Outbox worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.processor.run().await {
                error!(worker = %self.name, error = %e, "Outbox run failed");
            }

            // Fixed delay: measured from the end of one run to the start of
            // the next.
            tokio::select! {
                _ = tokio::time::sleep(self.scheduling.fixed_delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(worker = %self.name, "Outbox worker shutting down");
    }
}
