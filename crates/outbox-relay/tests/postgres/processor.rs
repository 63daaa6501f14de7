//! OutboxProcessor against PgStore.

use std::sync::Arc;

use outbox_relay::{
    HealthAggregator, HealthStatus, HealthThresholds, OutboxConfig, OutboxProcessor,
    OutboxStatus, OutboxStore, PgStore, RetryPolicy,
};
use test_utils::db_test;

use crate::support::db::{make_due, seed};
use crate::support::helpers::{RecordingPublisher, init_test_tracing};

fn config(max_attempts: u32) -> OutboxConfig {
    OutboxConfig {
        batch_size: 100,
        retry: RetryPolicy {
            max_attempts,
            ..Default::default()
        },
        ..Default::default()
    }
}

db_test!(publishes_and_marks_messages, |pool| {
    init_test_tracing();
    let store = PgStore::new(pool.clone());
    let ids = seed(&store, "orders", vec![br#"{"id":1}"#.to_vec()]).await?;

    let publisher = Arc::new(RecordingPublisher::default());
    let processor = OutboxProcessor::new(store.clone(), Arc::clone(&publisher), config(5));
    let report = processor.run().await?;

    assert_eq!(report.published, 1);
    assert_eq!(publisher.delivered(), vec![br#"{"id":1}"#.to_vec()]);
    let stored = store.get(ids[0]).await?.expect("stored");
    assert_eq!(stored.status(), OutboxStatus::Published);
    assert_eq!(stored.attempts(), 0);
    Ok(())
});

db_test!(retries_then_dead_letters, |pool| {
    init_test_tracing();
    let store = PgStore::new(pool.clone());
    let ids = seed(&store, "orders", vec![b"{}".to_vec()]).await?;

    let publisher = Arc::new(RecordingPublisher::failing());
    let processor = OutboxProcessor::new(store.clone(), Arc::clone(&publisher), config(2));

    assert_eq!(processor.run().await?.retried, 1);
    let stored = store.get(ids[0]).await?.expect("stored");
    assert_eq!(stored.status(), OutboxStatus::Failed);
    assert!(stored.next_retry_at() > time::OffsetDateTime::now_utc());

    make_due(pool, ids[0]).await?;
    assert_eq!(processor.run().await?.dead_lettered, 1);

    let stored = store.get(ids[0]).await?.expect("stored");
    assert_eq!(stored.status(), OutboxStatus::Dead);
    assert_eq!(stored.attempts(), 2);

    let health = HealthAggregator::new(
        store.clone(),
        HealthThresholds {
            warning_threshold: 0,
            error_threshold: 0,
        },
    )
    .check()
    .await;
    assert_eq!(health.status, HealthStatus::Down);
    Ok(())
});

db_test!(recovers_after_transient_outage, |pool| {
    init_test_tracing();
    let store = PgStore::new(pool.clone());
    let ids = seed(&store, "orders", vec![b"{}".to_vec()]).await?;

    let publisher = Arc::new(RecordingPublisher::failing());
    let processor = OutboxProcessor::new(store.clone(), Arc::clone(&publisher), config(5));
    processor.run().await?;

    publisher.set_failing(false);
    make_due(pool, ids[0]).await?;
    processor.run().await?;

    let stored = store.get(ids[0]).await?.expect("stored");
    assert_eq!(stored.status(), OutboxStatus::Published);
    assert_eq!(stored.attempts(), 1);
    assert_eq!(stored.last_error().map(|e| e.contains("broker unavailable")), Some(true));
    Ok(())
});
