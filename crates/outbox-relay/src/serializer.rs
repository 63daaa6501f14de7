//! Domain events and their conversion to outbox payloads.

use serde::Serialize;

use crate::error::Result;

/// A domain event that can be written to the outbox.
///
/// Usually derived:
///
/// ```ignore
/// use outbox_relay::OutboxEvent;
///
/// #[derive(Serialize, OutboxEvent)]
/// #[outbox(destination = "orders")]
/// enum OrderEvent {
///     Placed { order_id: u64 },
///     #[outbox(destination = "billing")]
///     Invoiced { order_id: u64, amount: i64 },
/// }
/// ```
pub trait OutboxEvent: Serialize {
    /// Logical topic or queue the event is published to.
    fn destination(&self) -> &str;

    /// Event name, recorded in the `event-type` header.
    fn event_type(&self) -> &str;
}

/// Turns a domain event into opaque payload bytes.
///
/// Called exactly once per message, when it is appended. An error here means
/// the event itself cannot be represented; it is returned to the caller so the
/// business transaction fails instead of leaving an undeliverable row behind.
pub trait Serializer: Send + Sync + 'static {
    /// MIME type recorded in the `content-type` header.
    fn content_type(&self) -> &str;

    fn serialize<E>(&self, event: &E) -> Result<Vec<u8>>
    where
        E: Serialize + ?Sized;
}

/// JSON payloads via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn serialize<E>(&self, event: &E) -> Result<Vec<u8>>
    where
        E: Serialize + ?Sized,
    {
        Ok(serde_json::to_vec(event)?)
    }
}
