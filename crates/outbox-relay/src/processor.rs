//! Claims due messages, publishes them, and records the outcome.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::OutboxConfig;
use crate::error::Result;
use crate::message::{OutboxMessage, RetryDecision};
use crate::publisher::{OutboundPublisher, PublishError};
use crate::store::OutboxStore;

/// Counts from one [`OutboxProcessor::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Stale `PROCESSING` messages returned to `PENDING` before claiming.
    pub released: u64,
    pub claimed: usize,
    pub published: usize,
    /// Failed attempts scheduled for another try.
    pub retried: usize,
    pub dead_lettered: usize,
    /// Messages whose final status could not be written. They stay
    /// `PROCESSING` until released as stale.
    pub update_failures: usize,
}

impl RunReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Published => self.published += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::DeadLettered => self.dead_lettered += 1,
            Outcome::UpdateFailed => self.update_failures += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Published,
    Retried,
    DeadLettered,
    UpdateFailed,
}

/// Drives messages from `PENDING` to `PUBLISHED` or `DEAD`.
///
/// Each call to [`run`](Self::run) is one bounded pass:
///
/// 1. Release claims older than `processing_timeout`
/// 2. Claim up to `batch_size` due messages
/// 3. Publish each one, at most `concurrency` at a time
/// 4. Mark it published, or record the failure with backoff
///
/// Only a failed claim makes `run` return an error. Anything that goes wrong
/// with an individual message is recorded on that message and counted in
/// the [`RunReport`].
///
/// Any number of processors may share one store; the store's claim keeps
/// them from publishing the same message concurrently.
///
/// # Example
///
/// ```ignore
/// let processor = OutboxProcessor::new(store, publisher, OutboxConfig::default());
/// let report = processor.run().await?;
/// tracing::info!(published = report.published, "outbox drained");
/// ```
pub struct OutboxProcessor<S, P> {
    store: S,
    publisher: P,
    config: OutboxConfig,
    clock: Arc<dyn Clock>,
    worker_id: String,
}

impl<S, P> OutboxProcessor<S, P>
where
    S: OutboxStore,
    P: OutboundPublisher,
{
    pub fn new(store: S, publisher: P, config: OutboxConfig) -> Self {
        let config = config.normalized();
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("outbox-{}", Uuid::now_v7()));

        Self {
            store,
            publisher,
            config,
            clock: Arc::new(SystemClock),
            worker_id,
        }
    }

    /// Use `clock` for `published_at` and retry scheduling.
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Process one batch.
    ///
    /// # Errors
    ///
    /// Returns the store error if the batch cannot be claimed. Nothing has
    /// been published in that case.
    pub async fn run(&self) -> Result<RunReport> {
        let deadline = Instant::now() + self.config.run_timeout;
        let mut report = RunReport::default();

        match self.store.release_stale(self.config.processing_timeout).await {
            Ok(0) => {}
            Ok(released) => {
                warn!(
                    worker_id = %self.worker_id,
                    released,
                    "Released stale outbox claims"
                );
                report.released = released;
            }
            Err(e) => {
                warn!(worker_id = %self.worker_id, error = %e, "Failed to release stale outbox claims");
            }
        }

        let claimed = match self.store.claim_batch(self.config.batch_size).await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(worker_id = %self.worker_id, error = %e, "Failed to claim outbox batch");
                return Err(e);
            }
        };
        report.claimed = claimed.len();

        if claimed.is_empty() {
            return Ok(report);
        }
        debug!(
            worker_id = %self.worker_id,
            claimed = report.claimed,
            "Processing outbox batch"
        );

        let outcomes: Vec<Outcome> = stream::iter(claimed)
            .map(|message| self.process(message, deadline))
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;
        for outcome in outcomes {
            report.record(outcome);
        }

        info!(
            worker_id = %self.worker_id,
            claimed = report.claimed,
            published = report.published,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            update_failures = report.update_failures,
            "Outbox run finished"
        );
        Ok(report)
    }

    async fn process(&self, message: OutboxMessage, deadline: Instant) -> Outcome {
        let attempt = message.attempts().saturating_add(1);
        debug!(
            message_id = %message.id(),
            destination = %message.destination(),
            attempt,
            "Publishing outbox message"
        );

        match self.publish(&message, deadline).await {
            Ok(()) => self.record_success(&message).await,
            Err(e) => self.record_failure(&message, &e).await,
        }
    }

    /// Publish within whichever ends first: `publish_timeout` or the run
    /// deadline.
    async fn publish(
        &self,
        message: &OutboxMessage,
        deadline: Instant,
    ) -> std::result::Result<(), PublishError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(PublishError::transient("run deadline exceeded"));
        }
        let limit: Duration = self.config.publish_timeout.min(remaining);

        let publish = self.publisher.publish(
            message.destination(),
            message.payload(),
            message.headers(),
        );
        match tokio::time::timeout(limit, publish).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(limit)),
        }
    }

    async fn record_success(&self, message: &OutboxMessage) -> Outcome {
        let id = message.id();
        match self.store.mark_published(id, self.clock.now()).await {
            Ok(()) => {
                debug!(message_id = %id, "Outbox message published");
                Outcome::Published
            }
            Err(e) => {
                // Delivered but not recorded: it will be published again once
                // the claim goes stale.
                error!(message_id = %id, error = %e, "Failed to mark outbox message published");
                Outcome::UpdateFailed
            }
        }
    }

    async fn record_failure(&self, message: &OutboxMessage, cause: &PublishError) -> Outcome {
        let id = message.id();
        let attempts = message.attempts().saturating_add(1);
        let next = self.config.retry.next_attempt(attempts);
        let reason = cause.to_string();

        let decision = if next.is_final {
            warn!(
                message_id = %id,
                destination = %message.destination(),
                error = %reason,
                attempts,
                max_attempts = self.config.retry.max_attempts,
                "Outbox message exceeded max attempts, moving to dead letter"
            );
            RetryDecision::DeadLetter
        } else {
            warn!(
                message_id = %id,
                destination = %message.destination(),
                error = %reason,
                permanent = cause.is_permanent(),
                attempts,
                retry_in_ms = next.delay.as_millis() as u64,
                "Outbox publish failed, will retry"
            );
            RetryDecision::RetryAt(self.clock.now() + next.delay)
        };

        match self.store.mark_failed(id, &reason, attempts, decision).await {
            Ok(()) if next.is_final => Outcome::DeadLettered,
            Ok(()) => Outcome::Retried,
            Err(e) => {
                error!(message_id = %id, error = %e, "Failed to record outbox publish failure");
                Outcome::UpdateFailed
            }
        }
    }
}

impl<S, P> std::fmt::Debug for OutboxProcessor<S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxProcessor")
            .field("worker_id", &self.worker_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
