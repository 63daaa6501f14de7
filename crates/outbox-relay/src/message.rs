//! The outbox message envelope and its lifecycle.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Lifecycle state of an outbox message.
///
/// ```text
/// PENDING ──claim──▶ PROCESSING ──▶ PUBLISHED
///                      │  ▲   │
///               failed │  │   └──▶ DEAD
///                      ▼  │ claim (once due)
///                     FAILED
/// ```
///
/// `PUBLISHED` and `DEAD` are terminal. A `PROCESSING` message whose claim went
/// stale can be released back to `PENDING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Published,
    Failed,
    Dead,
}

impl OutboxStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [OutboxStatus; 5] = [
        OutboxStatus::Pending,
        OutboxStatus::Processing,
        OutboxStatus::Published,
        OutboxStatus::Failed,
        OutboxStatus::Dead,
    ];

    /// The persisted spelling of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::Dead => "DEAD",
        }
    }

    /// Returns `true` for `PUBLISHED` and `DEAD`.
    pub fn is_terminal(self) -> bool {
        matches!(self, OutboxStatus::Published | OutboxStatus::Dead)
    }

    /// Returns `true` if a processor may claim a message in this status
    /// (subject to `next_retry_at`).
    pub fn is_claimable(self) -> bool {
        matches!(self, OutboxStatus::Pending | OutboxStatus::Failed)
    }

    /// The exhaustive transition table.
    pub fn can_transition_to(self, next: OutboxStatus) -> bool {
        use OutboxStatus::*;

        match (self, next) {
            (Pending | Failed, Processing) => true,
            (Processing, Published | Failed | Dead | Pending) => true,
            (Pending | Processing | Failed | Published | Dead, _) => false,
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        OutboxStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::UnknownStatus(s.to_owned()))
    }
}

/// Key/value metadata travelling with a message.
///
/// Resolved once, when the message is created, and opaque afterwards. Keys are
/// kept sorted so the stored form is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageHeaders(BTreeMap<String, String>);

impl MessageHeaders {
    pub const CORRELATION_ID: &'static str = "correlation-id";
    pub const CAUSATION_ID: &'static str = "causation-id";
    pub const TENANT_ID: &'static str = "tenant-id";
    pub const ACTOR_ID: &'static str = "actor-id";
    pub const CONTENT_TYPE: &'static str = "content-type";
    pub const EVENT_TYPE: &'static str = "event-type";

    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header, replacing any previous value for `key`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get(Self::CORRELATION_ID)
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.get(Self::CAUSATION_ID)
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.get(Self::TENANT_ID)
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.get(Self::ACTOR_ID)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get(Self::CONTENT_TYPE)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for MessageHeaders
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// What happens to a message after a failed publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Park the message as `FAILED` until the given instant, then claim it again.
    RetryAt(OffsetDateTime),
    /// Attempts are exhausted: move the message to `DEAD`.
    DeadLetter,
}

impl RetryDecision {
    /// The status a message ends up in under this decision.
    pub fn target_status(&self) -> OutboxStatus {
        match self {
            RetryDecision::RetryAt(_) => OutboxStatus::Failed,
            RetryDecision::DeadLetter => OutboxStatus::Dead,
        }
    }
}

/// Every persisted field of a message, for stores rebuilding one from storage.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: Uuid,
    pub destination: String,
    pub payload: Vec<u8>,
    pub headers: MessageHeaders,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub created_at: OffsetDateTime,
    pub last_attempt_at: Option<OffsetDateTime>,
    pub published_at: Option<OffsetDateTime>,
    pub next_retry_at: OffsetDateTime,
    pub last_error: Option<String>,
}

/// An event waiting in (or delivered from) the outbox.
///
/// The envelope (`id`, `destination`, `payload`, `headers`) has no setters and
/// never changes after [`OutboxMessage::new`]. Lifecycle fields only change
/// through the transition methods, which enforce
/// [`OutboxStatus::can_transition_to`].
///
/// `last_error` is kept after an eventual successful publish so operators can
/// see that a message needed retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    id: Uuid,
    destination: String,
    payload: Vec<u8>,
    headers: MessageHeaders,
    status: OutboxStatus,
    attempts: u32,
    created_at: OffsetDateTime,
    last_attempt_at: Option<OffsetDateTime>,
    published_at: Option<OffsetDateTime>,
    next_retry_at: OffsetDateTime,
    last_error: Option<String>,
}

impl OutboxMessage {
    /// Create a new `PENDING` message with a fresh UUID v7 id.
    ///
    /// The message is due immediately (`next_retry_at == created_at`).
    pub fn new(
        destination: impl Into<String>,
        payload: Vec<u8>,
        headers: MessageHeaders,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            destination: destination.into(),
            payload,
            headers,
            status: OutboxStatus::Pending,
            attempts: 0,
            created_at,
            last_attempt_at: None,
            published_at: None,
            next_retry_at: created_at,
            last_error: None,
        }
    }

    /// Replace the generated id, e.g. with an id the caller already shares
    /// with downstream consumers. Only valid before the message is appended.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn status(&self) -> OutboxStatus {
        self.status
    }

    /// Number of failed publish attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    /// When the message was last claimed for delivery.
    pub fn last_attempt_at(&self) -> Option<OffsetDateTime> {
        self.last_attempt_at
    }

    pub fn published_at(&self) -> Option<OffsetDateTime> {
        self.published_at
    }

    pub fn next_retry_at(&self) -> OffsetDateTime {
        self.next_retry_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Returns `true` if the message may be claimed at `now`.
    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.status.is_claimable() && self.next_retry_at <= now
    }

    /// `PENDING | FAILED -> PROCESSING`, stamping `last_attempt_at`.
    pub fn claim(&mut self, now: OffsetDateTime) -> Result<()> {
        self.transition(OutboxStatus::Processing)?;
        self.last_attempt_at = Some(now);
        Ok(())
    }

    /// `PROCESSING -> PUBLISHED`.
    ///
    /// Returns `Ok(false)` without touching the message if it is already
    /// published, so a redelivered acknowledgement is harmless.
    pub fn mark_published(&mut self, published_at: OffsetDateTime) -> Result<bool> {
        if self.status == OutboxStatus::Published {
            return Ok(false);
        }
        self.transition(OutboxStatus::Published)?;
        self.published_at = Some(published_at);
        Ok(true)
    }

    /// `PROCESSING -> FAILED | DEAD`, recording the failure.
    ///
    /// `attempts` never decreases: a stale caller passing a lower count leaves
    /// the stored count in place.
    pub fn mark_failed(
        &mut self,
        reason: impl Into<String>,
        attempts: u32,
        decision: RetryDecision,
    ) -> Result<()> {
        self.transition(decision.target_status())?;
        self.attempts = self.attempts.max(attempts);
        self.last_error = Some(reason.into());
        if let RetryDecision::RetryAt(at) = decision {
            self.next_retry_at = at;
        }
        Ok(())
    }

    /// `PROCESSING -> PENDING` for a claim that outlived its processor.
    pub fn release(&mut self) -> Result<()> {
        self.transition(OutboxStatus::Pending)
    }

    fn transition(&mut self, next: OutboxStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_transition(self.id, self.status, next));
        }
        self.status = next;
        Ok(())
    }
}

impl From<StoredMessage> for OutboxMessage {
    fn from(row: StoredMessage) -> Self {
        Self {
            id: row.id,
            destination: row.destination,
            payload: row.payload,
            headers: row.headers,
            status: row.status,
            attempts: row.attempts,
            created_at: row.created_at,
            last_attempt_at: row.last_attempt_at,
            published_at: row.published_at,
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
        }
    }
}
