//! Lifecycle properties over arbitrary publish outcomes.

use std::sync::Arc;
use std::time::Duration;

use outbox_relay::{InMemoryOutboxStore, ManualClock, OutboxProcessor, OutboxStatus};
use proptest::prelude::*;

use crate::support::{ScriptedPublisher, seed, stored, test_config};

/// Run one message through `outcomes` (then keep failing) and return its
/// final status and attempt count.
fn drive(outcomes: Vec<bool>, max_attempts: u32) -> anyhow::Result<(OutboxStatus, u32, u32)> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;

    rt.block_on(async {
        let clock = ManualClock::default();
        let store = InMemoryOutboxStore::with_clock(clock.clone());
        let ids = seed(&store, &clock, "orders", [b"{}".to_vec()]).await?;

        let publisher = Arc::new(ScriptedPublisher::new(outcomes, false));
        let processor = OutboxProcessor::new(
            store.clone(),
            Arc::clone(&publisher),
            test_config(max_attempts, 10),
        )
        .with_clock(clock.clone());

        for _ in 0..=max_attempts {
            processor.run().await?;
            // Past any backoff.
            clock.advance(Duration::from_secs(600));
        }

        let message = stored(&store, ids[0]).await?;
        Ok((message.status(), message.attempts(), publisher.calls()))
    })
}

proptest! {
    #[test]
    fn attempts_count_failures_until_published_or_dead(
        outcomes in prop::collection::vec(any::<bool>(), 0..12),
        max_attempts in 1u32..8,
    ) {
        let (status, attempts, calls) = drive(outcomes.clone(), max_attempts).unwrap();

        let failures_before_success = outcomes.iter().position(|ok| *ok);
        match failures_before_success {
            Some(failures) if (failures as u32) < max_attempts => {
                prop_assert_eq!(status, OutboxStatus::Published);
                prop_assert_eq!(attempts, failures as u32);
                prop_assert_eq!(calls, failures as u32 + 1);
            }
            _ => {
                prop_assert_eq!(status, OutboxStatus::Dead);
                prop_assert_eq!(attempts, max_attempts);
                prop_assert_eq!(calls, max_attempts);
            }
        }
    }
}
