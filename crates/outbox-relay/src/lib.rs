//! Transactional outbox for reliable, at-least-once event publishing.
//!
//! Domain events are written to an outbox table in the same transaction as
//! the business data that produced them. A processor later claims them,
//! publishes them to a broker, and records the outcome:
//!
//! - **Atomic append**: an event exists if and only if its transaction committed
//! - **Safe concurrency**: any number of processors share one store; a claim
//!   hands each message to exactly one of them
//! - **Bounded retries**: exponential backoff, then dead letter after
//!   `max_attempts`
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────── business transaction ─────────────────────┐
//! │   1. Begin unit of work                                                 │
//! │   2. Business writes                                                    │
//! │   3. OutboxWriter: serialize + capture context → append PENDING        │
//! │   4. Commit                                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//!
//! ┌───────────────────────────── OutboxProcessor::run ──────────────────────┐
//! │   1. Release stale PROCESSING claims                                    │
//! │   2. claim_batch → PROCESSING                                           │
//! │   3. publish each message                                               │
//! │   4. → PUBLISHED, or → FAILED (retry at) / DEAD                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use outbox_relay::{
//!     OutboxConfig, OutboxEvent, OutboxProcessor, OutboxStore, OutboxWriter, PgStore,
//!     ProcessorRuntime, StaticContext,
//! };
//!
//! #[derive(serde::Serialize, OutboxEvent)]
//! #[outbox(destination = "orders")]
//! enum OrderEvent {
//!     Placed { order_id: u64 },
//! }
//!
//! let store = PgStore::new(pool);
//! let writer = OutboxWriter::json();
//!
//! // Inside the business transaction
//! let mut uow = store.begin().await?;
//! writer.append(&mut uow, &OrderEvent::Placed { order_id: 1 }, &StaticContext::new()).await?;
//! uow.commit().await?;
//!
//! // In the relay process
//! let processor = OutboxProcessor::new(store, publisher, OutboxConfig::from_env());
//! ProcessorRuntime::new(processor).run(shutdown_signal).await;
//! ```
//!
//! # Feature Flags
//!
//! - `postgres`: enables [`PgStore`] for production use with PostgreSQL
//!
//! # Design Documentation
//!
//! See `DESIGN.md` for architectural decisions.

// Allow the crate to reference itself as `outbox_relay` for macro-generated code
extern crate self as outbox_relay;

mod clock;
mod config;
mod error;
pub mod health;
mod message;
mod metadata;
mod processor;
mod publisher;
mod retry;
mod runtime;
mod serializer;
pub mod store;
mod writer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{OutboxConfig, SchedulingConfig};
pub use error::{Error, Result};
pub use health::{HealthAggregator, HealthReport, HealthStatus, HealthThresholds, StatusCounts};
pub use message::{MessageHeaders, OutboxMessage, OutboxStatus, RetryDecision, StoredMessage};
pub use metadata::{AmbientContext, MetadataEnricher, StaticContext};
pub use processor::{OutboxProcessor, RunReport};
pub use publisher::{OutboundPublisher, PublishError};
pub use retry::{NextAttempt, RetryPolicy};
pub use runtime::ProcessorRuntime;
pub use serializer::{JsonSerializer, OutboxEvent, Serializer};
#[cfg(feature = "postgres")]
pub use store::{PgStore, PgUnitOfWork, append_in};
pub use store::{DeadLetterQuery, InMemoryOutboxStore, OutboxStore, UnitOfWork};
pub use writer::OutboxWriter;

// Re-export derive macros
pub use outbox_relay_macros::OutboxEvent;
