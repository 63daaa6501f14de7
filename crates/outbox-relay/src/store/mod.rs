//! Storage abstraction for outbox messages.
//!
//! This module provides the [`OutboxStore`] and [`UnitOfWork`] traits that
//! abstract over storage backends. Two implementations are provided:
//!
//! - [`InMemoryOutboxStore`]: mutex-guarded store for tests and single-process use
//! - [`PgStore`]: PostgreSQL storage for production (requires `postgres` feature)

mod memory;
mod outbox;
#[cfg(feature = "postgres")]
mod postgres;

use std::future::Future;

pub use memory::{InMemoryOutboxStore, InMemoryUnitOfWork};
pub use outbox::{DeadLetterQuery, OutboxStore};
#[cfg(feature = "postgres")]
pub use postgres::{PgStore, PgUnitOfWork, append_in};

use crate::error::Result;
use crate::message::OutboxMessage;

/// A transactional scope in which messages are appended.
///
/// Appends become visible to processors only when [`commit`](Self::commit)
/// succeeds. Dropping the unit of work without committing discards every
/// append, so an error anywhere in the business transaction (including a
/// serialization failure) leaves no outbox rows behind.
pub trait UnitOfWork: Send {
    /// Stage a new `PENDING` message.
    ///
    /// Fails with [`Error::DuplicateMessage`](crate::Error::DuplicateMessage)
    /// if the id already exists, after which the unit of work is unusable
    /// and every further call returns
    /// [`Error::UnitOfWorkClosed`](crate::Error::UnitOfWorkClosed)
    /// (mirroring an aborted database transaction).
    fn append(&mut self, message: OutboxMessage) -> impl Future<Output = Result<()>> + Send;

    /// Commit every staged message atomically.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;
}
