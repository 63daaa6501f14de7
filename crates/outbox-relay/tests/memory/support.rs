use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use outbox_relay::{
    InMemoryOutboxStore, ManualClock, MessageHeaders, OutboundPublisher, OutboxConfig,
    OutboxMessage, OutboxStore, PublishError, RetryPolicy, UnitOfWork,
};
use uuid::Uuid;

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("outbox_relay=debug")
        .with_test_writer()
        .try_init();
}

/// Config with the given attempt limit and no surprises from wall-clock
/// timeouts.
pub fn test_config(max_attempts: u32, batch_size: usize) -> OutboxConfig {
    OutboxConfig {
        batch_size,
        retry: RetryPolicy {
            max_attempts,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Append and commit one message per payload. Returns ids in order.
pub async fn seed(
    store: &InMemoryOutboxStore,
    clock: &ManualClock,
    destination: &str,
    payloads: impl IntoIterator<Item = Vec<u8>>,
) -> anyhow::Result<Vec<Uuid>> {
    use outbox_relay::Clock;

    let mut uow = store.begin().await?;
    let mut ids = Vec::new();
    for payload in payloads {
        let message = OutboxMessage::new(destination, payload, MessageHeaders::new(), clock.now());
        ids.push(message.id());
        uow.append(message).await?;
    }
    uow.commit().await?;
    Ok(ids)
}

pub async fn stored(store: &InMemoryOutboxStore, id: Uuid) -> anyhow::Result<OutboxMessage> {
    store
        .get(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("message {id} not found"))
}

/// A delivered message as seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub destination: String,
    pub payload: Vec<u8>,
}

/// Publisher driven by a script of outcomes.
///
/// Each call pops the next outcome (`true` = success); once the script runs
/// out, every call uses `fallback`.
pub struct ScriptedPublisher {
    script: Mutex<VecDeque<bool>>,
    fallback: bool,
    calls: Mutex<u32>,
    delivered: Mutex<Vec<Delivery>>,
}

impl ScriptedPublisher {
    pub fn new(script: impl IntoIterator<Item = bool>, fallback: bool) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            calls: Mutex::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn always_ok() -> Self {
        Self::new([], true)
    }

    pub fn always_failing() -> Self {
        Self::new([], false)
    }

    /// Fail the first `failures` calls, then succeed.
    pub fn failing_times(failures: usize) -> Self {
        Self::new(std::iter::repeat_n(false, failures), true)
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }

    pub fn delivered(&self) -> Vec<Delivery> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutboundPublisher for ScriptedPublisher {
    async fn publish(
        &self,
        destination: &str,
        payload: &[u8],
        _headers: &MessageHeaders,
    ) -> Result<(), PublishError> {
        *self.calls.lock().unwrap() += 1;
        let ok = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
        if !ok {
            return Err(PublishError::transient("broker unavailable"));
        }
        self.delivered.lock().unwrap().push(Delivery {
            destination: destination.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

/// Publisher that takes `delay` per call.
pub struct SlowPublisher {
    pub delay: Duration,
}

#[async_trait]
impl OutboundPublisher for SlowPublisher {
    async fn publish(
        &self,
        _destination: &str,
        _payload: &[u8],
        _headers: &MessageHeaders,
    ) -> Result<(), PublishError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// Publisher that succeeds but takes the store offline while doing so, so
/// the following status update fails.
pub struct OutageDuringPublish {
    pub store: InMemoryOutboxStore,
    pub delivered: Mutex<u32>,
}

#[async_trait]
impl OutboundPublisher for OutageDuringPublish {
    async fn publish(
        &self,
        _destination: &str,
        _payload: &[u8],
        _headers: &MessageHeaders,
    ) -> Result<(), PublishError> {
        self.store.set_available(false);
        *self.delivered.lock().unwrap() += 1;
        Ok(())
    }
}
