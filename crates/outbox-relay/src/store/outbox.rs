//! Outbox storage operations used by writers, the processor, and health checks.

use std::future::Future;
use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

use super::UnitOfWork;
use crate::error::Result;
use crate::message::{OutboxMessage, OutboxStatus, RetryDecision};

/// Query parameters for fetching dead letters.
///
/// Use the builder methods to filter by destination or limit the number of
/// results.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterQuery {
    /// Filter by destination.
    pub destination: Option<String>,
    /// Maximum number of results to return. Default: 100.
    pub limit: Option<u32>,
}

impl DeadLetterQuery {
    pub const DEFAULT_LIMIT: u32 = 100;

    /// Create a new empty query (matches all dead letters).
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by destination.
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Limit the number of results.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT) as usize
    }

    pub(crate) fn matches(&self, message: &OutboxMessage) -> bool {
        message.status() == OutboxStatus::Dead
            && self
                .destination
                .as_deref()
                .is_none_or(|d| d == message.destination())
    }
}

/// Durable outbox storage.
///
/// All mutation of stored messages goes through these operations; nothing
/// else reads or writes outbox rows directly.
///
/// # Claim Protocol
///
/// 1. [`claim_batch`](Self::claim_batch) atomically moves due messages to
///    `PROCESSING` and hands them to exactly one caller
/// 2. The caller publishes each message
/// 3. [`mark_published`](Self::mark_published) or
///    [`mark_failed`](Self::mark_failed) ends the claim
/// 4. If the caller dies in between, [`release_stale`](Self::release_stale)
///    eventually returns the message to `PENDING`
pub trait OutboxStore: Send + Sync + Clone + 'static {
    /// The unit of work type returned by this store.
    type UnitOfWork<'a>: UnitOfWork + Send
    where
        Self: 'a;

    /// Open a unit of work for appending messages.
    fn begin<'a>(&'a self) -> impl Future<Output = Result<Self::UnitOfWork<'a>>> + Send;

    /// Claim up to `limit` due messages, oldest first.
    ///
    /// A message is due when it is `PENDING` or `FAILED` and its
    /// `next_retry_at` has passed. Claimed messages are `PROCESSING` with
    /// `last_attempt_at` set to the claim time.
    ///
    /// Concurrent callers never receive the same message.
    fn claim_batch(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<OutboxMessage>>> + Send;

    /// `PROCESSING -> PUBLISHED`.
    ///
    /// A no-op returning `Ok(())` if the message is already published.
    fn mark_published(
        &self,
        id: Uuid,
        published_at: OffsetDateTime,
    ) -> impl Future<Output = Result<()>> + Send;

    /// `PROCESSING -> FAILED` (retry at the given time) or `-> DEAD`.
    ///
    /// Records `reason` as `last_error` and `attempts` as the failure count.
    fn mark_failed(
        &self,
        id: Uuid,
        reason: &str,
        attempts: u32,
        decision: RetryDecision,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Number of messages currently in `status`.
    fn count_by_status(&self, status: OutboxStatus) -> impl Future<Output = Result<i64>> + Send;

    /// Return `PROCESSING` messages claimed more than `older_than` ago to
    /// `PENDING`, leaving `attempts` unchanged.
    ///
    /// [`mark_published`](Self::mark_published) and
    /// [`mark_failed`](Self::mark_failed) only check for `PROCESSING`, not
    /// whose claim set it. A late update from a processor whose claim was
    /// released can overwrite a newer claim; delivery stays at-least-once.
    ///
    /// Returns the number of released messages.
    fn release_stale(&self, older_than: Duration) -> impl Future<Output = Result<u64>> + Send;

    /// Look up a single message.
    fn get(&self, id: Uuid) -> impl Future<Output = Result<Option<OutboxMessage>>> + Send;

    /// Fetch dead-lettered messages matching the query, newest first.
    fn fetch_dead_letters(
        &self,
        query: &DeadLetterQuery,
    ) -> impl Future<Output = Result<Vec<OutboxMessage>>> + Send;
}
