//! Turning domain events into outbox messages inside a business transaction.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::message::OutboxMessage;
use crate::metadata::{AmbientContext, MetadataEnricher};
use crate::serializer::{JsonSerializer, OutboxEvent, Serializer};
use crate::store::UnitOfWork;

/// Serializes events, captures ambient context, and appends the result to a
/// [`UnitOfWork`].
///
/// # Example
///
/// ```ignore
/// let writer = OutboxWriter::json();
///
/// let mut uow = store.begin().await?;
/// // ... business writes through the same transaction ...
/// writer.append(&mut uow, &OrderEvent::Placed { order_id: 1 }, &ctx).await?;
/// uow.commit().await?;
/// ```
#[derive(Clone)]
pub struct OutboxWriter<Z> {
    serializer: Z,
    enricher: MetadataEnricher,
    clock: Arc<dyn Clock>,
}

impl OutboxWriter<JsonSerializer> {
    pub fn json() -> Self {
        Self::new(JsonSerializer)
    }
}

impl<Z> OutboxWriter<Z>
where
    Z: Serializer,
{
    pub fn new(serializer: Z) -> Self {
        let enricher = MetadataEnricher::new(serializer.content_type());
        Self {
            serializer,
            enricher,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp `created_at` from `clock`.
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Build the `PENDING` message for `event` without storing it.
    pub fn prepare<E>(&self, event: &E, ctx: &dyn AmbientContext) -> Result<OutboxMessage>
    where
        E: OutboxEvent + ?Sized,
    {
        let payload = self.serializer.serialize(event)?;
        let headers = self.enricher.enrich(event, ctx);
        Ok(OutboxMessage::new(
            event.destination(),
            payload,
            headers,
            self.clock.now(),
        ))
    }

    /// Append `event` to `uow` and return the new message id.
    ///
    /// A serialization error is returned before anything is staged; the
    /// caller should drop the unit of work so the business writes roll back
    /// with it.
    pub fn append<'a, U, E>(
        &self,
        uow: &'a mut U,
        event: &E,
        ctx: &dyn AmbientContext,
    ) -> impl Future<Output = Result<Uuid>> + Send + use<'a, Z, U, E>
    where
        U: UnitOfWork,
        E: OutboxEvent + ?Sized,
    {
        // Context is read here, synchronously, so the returned future does
        // not borrow it.
        let prepared = self.prepare(event, ctx);

        async move {
            let message = prepared?;
            let id = message.id();
            let destination = message.destination().to_string();
            uow.append(message).await?;
            debug!(message_id = %id, %destination, "Outbox message appended");
            Ok(id)
        }
    }
}

impl<Z: std::fmt::Debug> std::fmt::Debug for OutboxWriter<Z> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxWriter")
            .field("serializer", &self.serializer)
            .field("enricher", &self.enricher)
            .finish_non_exhaustive()
    }
}
