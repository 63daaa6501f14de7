//! In-memory outbox store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::outbox::{DeadLetterQuery, OutboxStore};
use super::UnitOfWork;
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::message::{OutboxMessage, OutboxStatus, RetryDecision};

/// Rows keyed by insertion sequence, so equal `created_at` values still claim
/// in append order.
#[derive(Default)]
struct Rows {
    by_seq: BTreeMap<u64, OutboxMessage>,
    seq_by_id: HashMap<Uuid, u64>,
    next_seq: u64,
}

impl Rows {
    fn contains(&self, id: Uuid) -> bool {
        self.seq_by_id.contains_key(&id)
    }

    fn insert(&mut self, message: OutboxMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.seq_by_id.insert(message.id(), seq);
        self.by_seq.insert(seq, message);
    }

    fn get_mut(&mut self, id: Uuid) -> Result<&mut OutboxMessage> {
        self.seq_by_id
            .get(&id)
            .and_then(|seq| self.by_seq.get_mut(seq))
            .ok_or(Error::MessageNotFound(id))
    }
}

struct Inner {
    rows: Mutex<Rows>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

/// Outbox store backed by process memory.
///
/// Every operation takes a single mutex, which makes [`claim_batch`] atomic
/// with respect to other claimers. Clones share the same rows.
///
/// The store can be switched off with [`set_available`](Self::set_available)
/// to exercise storage-outage paths.
///
/// [`claim_batch`]: OutboxStore::claim_batch
#[derive(Clone)]
pub struct InMemoryOutboxStore {
    inner: Arc<Inner>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Create a store that reads "now" from `clock` when claiming.
    pub fn with_clock(clock: impl Clock) -> Self {
        Self {
            inner: Arc::new(Inner {
                rows: Mutex::new(Rows::default()),
                clock: Arc::new(clock),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate an outage: while unavailable every operation fails with
    /// [`Error::Storage`].
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Total number of stored messages.
    pub fn len(&self) -> usize {
        self.rows().by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn rows(&self) -> MutexGuard<'_, Rows> {
        self.inner.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::storage("in-memory outbox store is unavailable"))
        }
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryOutboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOutboxStore")
            .field("messages", &self.len())
            .finish()
    }
}

/// Unit of work that stages appends until commit.
pub struct InMemoryUnitOfWork<'a> {
    store: &'a InMemoryOutboxStore,
    staged: Vec<OutboxMessage>,
    aborted: bool,
}

impl UnitOfWork for InMemoryUnitOfWork<'_> {
    async fn append(&mut self, message: OutboxMessage) -> Result<()> {
        if self.aborted {
            return Err(Error::UnitOfWorkClosed);
        }
        self.store.check_available()?;

        let id = message.id();
        let duplicate =
            self.staged.iter().any(|m| m.id() == id) || self.store.rows().contains(id);
        if duplicate {
            self.aborted = true;
            return Err(Error::DuplicateMessage(id));
        }

        if message.status() != OutboxStatus::Pending {
            self.aborted = true;
            return Err(Error::invalid_transition(
                id,
                message.status(),
                OutboxStatus::Pending,
            ));
        }

        self.staged.push(message);
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        if self.aborted {
            return Err(Error::UnitOfWorkClosed);
        }
        self.store.check_available()?;

        let mut rows = self.store.rows();
        // Another unit of work may have committed the same id since append.
        if let Some(dup) = self.staged.iter().find(|m| rows.contains(m.id())) {
            return Err(Error::DuplicateMessage(dup.id()));
        }
        for message in self.staged {
            rows.insert(message);
        }
        Ok(())
    }
}

impl OutboxStore for InMemoryOutboxStore {
    type UnitOfWork<'a> = InMemoryUnitOfWork<'a>;

    async fn begin<'a>(&'a self) -> Result<Self::UnitOfWork<'a>> {
        self.check_available()?;
        Ok(InMemoryUnitOfWork {
            store: self,
            staged: Vec::new(),
            aborted: false,
        })
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        self.check_available()?;
        let now = self.inner.clock.now();
        let mut rows = self.rows();

        let mut due: Vec<(OffsetDateTime, u64)> = rows
            .by_seq
            .iter()
            .filter(|(_, m)| m.is_due(now))
            .map(|(seq, m)| (m.created_at(), *seq))
            .collect();
        due.sort_unstable();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, seq) in due {
            if let Some(message) = rows.by_seq.get_mut(&seq) {
                message.claim(now)?;
                claimed.push(message.clone());
            }
        }

        debug!(claimed = claimed.len(), limit, "Claimed outbox batch");
        Ok(claimed)
    }

    async fn mark_published(&self, id: Uuid, published_at: OffsetDateTime) -> Result<()> {
        self.check_available()?;
        self.rows().get_mut(id)?.mark_published(published_at)?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        reason: &str,
        attempts: u32,
        decision: RetryDecision,
    ) -> Result<()> {
        self.check_available()?;
        self.rows().get_mut(id)?.mark_failed(reason, attempts, decision)
    }

    async fn count_by_status(&self, status: OutboxStatus) -> Result<i64> {
        self.check_available()?;
        let count = self
            .rows()
            .by_seq
            .values()
            .filter(|m| m.status() == status)
            .count();
        Ok(count as i64)
    }

    async fn release_stale(&self, older_than: Duration) -> Result<u64> {
        self.check_available()?;
        let cutoff = self.inner.clock.now() - older_than;
        let mut released = 0;

        for message in self.rows().by_seq.values_mut() {
            let stale = message.status() == OutboxStatus::Processing
                && message.last_attempt_at().is_none_or(|at| at < cutoff);
            if stale {
                message.release()?;
                released += 1;
            }
        }

        Ok(released)
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>> {
        self.check_available()?;
        let rows = self.rows();
        Ok(rows
            .seq_by_id
            .get(&id)
            .and_then(|seq| rows.by_seq.get(seq))
            .cloned())
    }

    async fn fetch_dead_letters(&self, query: &DeadLetterQuery) -> Result<Vec<OutboxMessage>> {
        self.check_available()?;
        Ok(self
            .rows()
            .by_seq
            .values()
            .rev()
            .filter(|m| query.matches(m))
            .take(query.effective_limit())
            .cloned()
            .collect())
    }
}
