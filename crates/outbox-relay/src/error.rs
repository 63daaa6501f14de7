//! Error types for outbox-relay.

use thiserror::Error;
use uuid::Uuid;

use crate::message::OutboxStatus;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by outbox stores, writers, and the processor.
///
/// Publish failures are not in here: they are reported through
/// [`PublishError`](crate::PublishError) and recorded on the message instead of
/// being propagated.
#[derive(Debug, Error)]
pub enum Error {
    /// A domain event could not be serialized into a payload.
    ///
    /// Raised at append time. The caller's unit of work must not be committed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// PostgreSQL storage error.
    ///
    /// Preserves the full `sqlx::Error` for matching on specific database
    /// error conditions (connection timeout, constraint violation, etc.).
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A message with this id already exists in the outbox.
    #[error("duplicate outbox message id: {0}")]
    DuplicateMessage(Uuid),

    /// The unit of work was already committed or rolled back.
    #[error("unit of work is no longer active")]
    UnitOfWorkClosed,

    /// No message with this id exists.
    #[error("outbox message not found: {0}")]
    MessageNotFound(Uuid),

    /// A status update was requested that the lifecycle does not allow.
    #[error("illegal status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        /// The message being updated.
        id: Uuid,
        /// Its current status.
        from: OutboxStatus,
        /// The requested status.
        to: OutboxStatus,
    },

    /// A stored status string did not match any known status.
    #[error("unknown outbox status: {0}")]
    UnknownStatus(String),

    /// The backing store is unavailable or rejected the operation.
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Create a storage error from any displayable cause.
    pub fn storage(cause: impl std::fmt::Display) -> Self {
        Error::Storage(cause.to_string())
    }

    /// Create an invalid transition error.
    pub fn invalid_transition(id: Uuid, from: OutboxStatus, to: OutboxStatus) -> Self {
        Error::InvalidTransition { id, from, to }
    }
}
