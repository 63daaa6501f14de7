//! Contract for delivering payloads to a broker.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::MessageHeaders;

/// Why a publish attempt failed.
///
/// The classification is informational. Every variant goes through the same
/// bounded retry and dead-letter path, because a broker's "rejected" is not
/// reliable enough to skip retries on. A permanently rejected message
/// therefore still burns `max_attempts` before it is dead-lettered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// Broker or network unavailable; worth retrying.
    #[error("transient publish failure: {0}")]
    Transient(String),

    /// The broker refused the message itself (invalid, too large, unauthorized).
    #[error("message rejected by broker: {0}")]
    Rejected(String),

    /// The publish call did not finish in time.
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

impl PublishError {
    pub fn transient(cause: impl std::fmt::Display) -> Self {
        PublishError::Transient(cause.to_string())
    }

    pub fn rejected(cause: impl std::fmt::Display) -> Self {
        PublishError::Rejected(cause.to_string())
    }

    /// Returns `true` if the broker positively refused the message.
    pub fn is_permanent(&self) -> bool {
        matches!(self, PublishError::Rejected(_))
    }
}

/// Delivers a message to its destination.
///
/// # Idempotency
///
/// Delivery is **at-least-once**. A message may be published again after a
/// crash between a successful publish and the status update, or after a
/// stale claim is released. Consumers must deduplicate on the message id,
/// which implementations should forward (e.g. as a broker message id).
///
/// # Example
///
/// ```ignore
/// struct NatsPublisher {
///     client: async_nats::Client,
/// }
///
/// #[async_trait]
/// impl OutboundPublisher for NatsPublisher {
///     async fn publish(
///         &self,
///         destination: &str,
///         payload: &[u8],
///         headers: &MessageHeaders,
///     ) -> Result<(), PublishError> {
///         let mut nats_headers = async_nats::HeaderMap::new();
///         for (key, value) in headers.iter() {
///             nats_headers.insert(key, value);
///         }
///         self.client
///             .publish_with_headers(destination.to_owned(), nats_headers, payload.to_vec().into())
///             .await
///             .map_err(PublishError::transient)
///     }
/// }
/// ```
#[async_trait]
pub trait OutboundPublisher: Send + Sync + 'static {
    async fn publish(
        &self,
        destination: &str,
        payload: &[u8],
        headers: &MessageHeaders,
    ) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> OutboundPublisher for std::sync::Arc<P>
where
    P: OutboundPublisher + ?Sized,
{
    async fn publish(
        &self,
        destination: &str,
        payload: &[u8],
        headers: &MessageHeaders,
    ) -> Result<(), PublishError> {
        (**self).publish(destination, payload, headers).await
    }
}
