//! Relay behaviour while the event bus is rejecting publishes.

use std::collections::HashSet;
use std::time::Duration;

use event_bus::InMemoryEventBus;
use outbox::{
    BusinessRecord, InMemoryParticipantStore, OutboxRelay, OutboxRow, OutboxStatus,
    ParticipantStore, RelayConfig,
};
use tokio_util::sync::CancellationToken;

async fn seed(store: &InMemoryParticipantStore, aggregate_id: &str, event_type: &str) {
    store
        .commit(
            BusinessRecord::new(aggregate_id, "order", serde_json::json!({})),
            OutboxRow::new("Order", aggregate_id, event_type, serde_json::json!({})),
        )
        .await
        .unwrap();
}

/// S5: the bus rejects publishes for a while. Business writes proceed,
/// rows accumulate PENDING, and once the bus recovers everything is
/// published in per-aggregate order with no DEAD rows.
#[tokio::test]
async fn bus_outage_backs_up_then_drains_in_order() {
    let store = InMemoryParticipantStore::new();
    let bus = InMemoryEventBus::new();

    seed(&store, "ORD-1", "OrderCreated").await;
    seed(&store, "ORD-1", "OrderCancelled").await;
    seed(&store, "RES-1", "InventoryReserved").await;

    bus.set_fail_publish(true);

    let relay = OutboxRelay::new(
        "order",
        store.clone(),
        bus.clone(),
        RelayConfig {
            poll_interval: Duration::from_millis(20),
            batch_size: 100,
            dead_attempts: 50,
        },
    );
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(relay.run(cancel.clone()));

    // Business writes keep landing during the outage.
    tokio::time::sleep(Duration::from_millis(100)).await;
    seed(&store, "RES-2", "InventoryReserved").await;
    assert_eq!(bus.published_count(), 0);
    assert_eq!(store.count_with_status(OutboxStatus::Pending), 4);

    tokio::time::sleep(Duration::from_millis(100)).await;
    bus.set_fail_publish(false);

    // Once the bus recovers, the backlog drains.
    for _ in 0..100 {
        if store.count_with_status(OutboxStatus::Delivered) == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(store.count_with_status(OutboxStatus::Delivered), 4);
    // The outage was far shorter than dead_attempts * poll_interval.
    assert_eq!(store.count_with_status(OutboxStatus::Dead), 0);

    // Per-aggregate order held across the outage.
    assert_eq!(
        bus.event_types_for_key("ORD-1"),
        vec!["OrderCreated", "OrderCancelled"]
    );

    // At-least-once with consumer dedup: every event id arrived, and
    // collapsing duplicates by id yields exactly one effect each.
    let delivered: Vec<_> = bus.messages();
    let unique: HashSet<_> = delivered.iter().map(|m| m.event_id).collect();
    assert_eq!(unique.len(), 4);
    for row in store.outbox_rows() {
        assert!(bus.delivery_count(row.event_id) >= 1);
    }
}
