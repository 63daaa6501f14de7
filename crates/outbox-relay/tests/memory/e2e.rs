//! End-to-end flows: append inside a unit of work, relay, inspect.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use outbox_relay::{
    Clock, DeadLetterQuery, InMemoryOutboxStore, ManualClock, MessageHeaders, OutboxEvent,
    OutboxProcessor, OutboxStatus, OutboxStore, OutboxWriter, StaticContext, UnitOfWork,
};
use serde::Serialize;

use crate::support::{ScriptedPublisher, init_test_tracing, seed, stored, test_config};

#[derive(Serialize, OutboxEvent)]
#[outbox(destination = "orders")]
#[serde(tag = "type")]
enum OrderEvent {
    Placed { id: u64 },
    #[outbox(destination = "billing", event_type = "order.invoiced")]
    Invoiced { id: u64, amount: i64 },
}

#[tokio::test]
async fn single_message_is_published_without_retries() -> anyhow::Result<()> {
    init_test_tracing();
    let clock = ManualClock::default();
    let store = InMemoryOutboxStore::with_clock(clock.clone());
    let ids = seed(&store, &clock, "orders", [br#"{"id":1}"#.to_vec()]).await?;

    let publisher = Arc::new(ScriptedPublisher::always_ok());
    let processor = OutboxProcessor::new(store.clone(), Arc::clone(&publisher), test_config(5, 100))
        .with_clock(clock.clone());
    let report = processor.run().await?;

    assert_eq!(report.published, 1);
    let message = stored(&store, ids[0]).await?;
    assert_eq!(message.status(), OutboxStatus::Published);
    assert_eq!(message.attempts(), 0);
    assert_eq!(publisher.delivered()[0].destination, "orders");
    assert_eq!(publisher.delivered()[0].payload, br#"{"id":1}"#);
    Ok(())
}

#[tokio::test]
async fn two_failures_then_success_records_two_attempts() -> anyhow::Result<()> {
    init_test_tracing();
    let clock = ManualClock::default();
    let store = InMemoryOutboxStore::with_clock(clock.clone());
    let ids = seed(&store, &clock, "orders", [b"{}".to_vec()]).await?;

    let publisher = Arc::new(ScriptedPublisher::failing_times(2));
    let processor = OutboxProcessor::new(store.clone(), Arc::clone(&publisher), test_config(5, 100))
        .with_clock(clock.clone());

    for _ in 0..3 {
        processor.run().await?;
        clock.advance(Duration::from_secs(300));
    }

    let message = stored(&store, ids[0]).await?;
    assert_eq!(message.status(), OutboxStatus::Published);
    assert_eq!(message.attempts(), 2);
    assert_eq!(publisher.calls(), 3);
    Ok(())
}

#[tokio::test]
async fn always_failing_message_is_dead_lettered_after_max_attempts() -> anyhow::Result<()> {
    init_test_tracing();
    let clock = ManualClock::default();
    let store = InMemoryOutboxStore::with_clock(clock.clone());
    let ids = seed(&store, &clock, "orders", [b"{}".to_vec()]).await?;

    let publisher = Arc::new(ScriptedPublisher::always_failing());
    let processor = OutboxProcessor::new(store.clone(), Arc::clone(&publisher), test_config(3, 100))
        .with_clock(clock.clone());

    // 1st failure: retry after 1s * 2^1.
    processor.run().await?;
    let message = stored(&store, ids[0]).await?;
    assert_eq!(message.status(), OutboxStatus::Failed);
    assert_eq!(message.next_retry_at(), clock.now() + Duration::from_secs(2));

    // Not due before next_retry_at.
    clock.advance(Duration::from_secs(1));
    assert_eq!(processor.run().await?.claimed, 0);

    // 2nd failure: retry after 1s * 2^2.
    clock.advance(Duration::from_secs(1));
    processor.run().await?;
    assert_eq!(stored(&store, ids[0]).await?.attempts(), 2);

    // 3rd failure is final.
    clock.advance(Duration::from_secs(4));
    let report = processor.run().await?;
    assert_eq!(report.dead_lettered, 1);

    let message = stored(&store, ids[0]).await?;
    assert_eq!(message.status(), OutboxStatus::Dead);
    assert_eq!(message.attempts(), 3);
    assert_eq!(publisher.calls(), 3);

    // Dead letters are never claimed again.
    clock.advance(Duration::from_secs(3600));
    assert_eq!(processor.run().await?.claimed, 0);

    let dead = store.fetch_dead_letters(&DeadLetterQuery::new()).await?;
    assert_eq!(dead.len(), 1);
    assert!(dead[0].last_error().is_some_and(|e| e.contains("broker unavailable")));
    Ok(())
}

#[tokio::test]
async fn backlog_larger_than_batch_drains_over_two_runs() -> anyhow::Result<()> {
    init_test_tracing();
    let clock = ManualClock::default();
    let store = InMemoryOutboxStore::with_clock(clock.clone());
    seed(
        &store,
        &clock,
        "orders",
        (0..200).map(|i: u32| i.to_be_bytes().to_vec()),
    )
    .await?;

    let publisher = Arc::new(ScriptedPublisher::always_ok());
    let processor = OutboxProcessor::new(store.clone(), Arc::clone(&publisher), test_config(5, 100))
        .with_clock(clock.clone());

    assert_eq!(processor.run().await?.claimed, 100);
    assert_eq!(store.count_by_status(OutboxStatus::Pending).await?, 100);
    assert_eq!(processor.run().await?.claimed, 100);
    assert_eq!(processor.run().await?.claimed, 0);

    assert_eq!(store.count_by_status(OutboxStatus::Published).await?, 200);
    // Oldest first, and append order breaks created_at ties.
    let first: Vec<u32> = publisher.delivered()[..3]
        .iter()
        .map(|d| u32::from_be_bytes(d.payload.clone().try_into().unwrap()))
        .collect();
    assert_eq!(first, [0, 1, 2]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_processors_publish_each_message_once() -> anyhow::Result<()> {
    init_test_tracing();
    let store = InMemoryOutboxStore::new();
    let clock = ManualClock::new(time::OffsetDateTime::now_utc());
    seed(
        &store,
        &clock,
        "orders",
        (0..300).map(|i: u32| i.to_be_bytes().to_vec()),
    )
    .await?;

    let publisher = Arc::new(ScriptedPublisher::always_ok());
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let processor = OutboxProcessor::new(
                store.clone(),
                Arc::clone(&publisher),
                test_config(5, 16),
            )
            .with_worker_id(format!("relay-{i}"));
            tokio::spawn(async move {
                loop {
                    let report = processor.run().await?;
                    if report.claimed == 0 {
                        return anyhow::Ok(());
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await??;
    }

    let delivered = publisher.delivered();
    assert_eq!(delivered.len(), 300);
    let unique: HashSet<_> = delivered.iter().map(|d| d.payload.clone()).collect();
    assert_eq!(unique.len(), 300, "a message was published twice");
    Ok(())
}

#[tokio::test]
async fn writer_captures_context_and_routes_by_variant() -> anyhow::Result<()> {
    init_test_tracing();
    let clock = ManualClock::default();
    let store = InMemoryOutboxStore::with_clock(clock.clone());
    let writer = OutboxWriter::json().with_clock(clock.clone());
    let ctx = StaticContext::new()
        .tenant("acme")
        .correlation("req-42")
        .actor("user-7");

    let mut uow = store.begin().await?;
    let placed = writer.append(&mut uow, &OrderEvent::Placed { id: 1 }, &ctx).await?;
    let invoiced = writer
        .append(&mut uow, &OrderEvent::Invoiced { id: 1, amount: 990 }, &ctx)
        .await?;
    uow.commit().await?;

    let placed = stored(&store, placed).await?;
    assert_eq!(placed.destination(), "orders");
    assert_eq!(placed.headers().get(MessageHeaders::EVENT_TYPE), Some("Placed"));
    assert_eq!(placed.headers().tenant_id(), Some("acme"));
    assert_eq!(placed.headers().correlation_id(), Some("req-42"));
    assert!(placed.headers().causation_id().is_none());
    assert_eq!(placed.created_at(), clock.now());

    let invoiced = stored(&store, invoiced).await?;
    assert_eq!(invoiced.destination(), "billing");
    assert_eq!(
        invoiced.headers().get(MessageHeaders::EVENT_TYPE),
        Some("order.invoiced")
    );
    let payload: serde_json::Value = serde_json::from_slice(invoiced.payload())?;
    assert_eq!(payload["type"], "Invoiced");
    assert_eq!(payload["amount"], 990);

    let publisher = Arc::new(ScriptedPublisher::always_ok());
    let processor = OutboxProcessor::new(store.clone(), Arc::clone(&publisher), test_config(5, 100))
        .with_clock(clock.clone());
    processor.run().await?;

    let destinations: Vec<_> = publisher
        .delivered()
        .into_iter()
        .map(|d| d.destination)
        .collect();
    assert_eq!(destinations, ["orders", "billing"]);
    Ok(())
}

#[tokio::test]
async fn uncommitted_unit_of_work_publishes_nothing() -> anyhow::Result<()> {
    let clock = ManualClock::default();
    let store = InMemoryOutboxStore::with_clock(clock.clone());
    let writer = OutboxWriter::json();

    {
        let mut uow = store.begin().await?;
        writer
            .append(&mut uow, &OrderEvent::Placed { id: 1 }, &StaticContext::new())
            .await?;
        // Business write failed; the unit of work is dropped.
    }

    let publisher = Arc::new(ScriptedPublisher::always_ok());
    let processor = OutboxProcessor::new(store.clone(), Arc::clone(&publisher), test_config(5, 100))
        .with_clock(clock.clone());
    assert_eq!(processor.run().await?.claimed, 0);
    assert_eq!(publisher.calls(), 0);
    Ok(())
}
