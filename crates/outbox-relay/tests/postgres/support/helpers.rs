use std::sync::Mutex;

use async_trait::async_trait;
use outbox_relay::{MessageHeaders, OutboundPublisher, PublishError};

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("outbox_relay=debug")
        .with_test_writer()
        .try_init();
}

/// Records deliveries; fails every call while `failing` is set.
#[derive(Default)]
pub struct RecordingPublisher {
    failing: Mutex<bool>,
    delivered: Mutex<Vec<Vec<u8>>>,
}

impl RecordingPublisher {
    pub fn failing() -> Self {
        Self {
            failing: Mutex::new(true),
            ..Default::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn delivered(&self) -> Vec<Vec<u8>> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutboundPublisher for RecordingPublisher {
    async fn publish(
        &self,
        _destination: &str,
        payload: &[u8],
        headers: &MessageHeaders,
    ) -> Result<(), PublishError> {
        if *self.failing.lock().unwrap() {
            return Err(PublishError::transient("broker unavailable"));
        }
        assert_eq!(headers.correlation_id(), Some("test"));
        self.delivered.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}
