//! Crash recovery, leasing, and shutdown behaviour.
//!
//! A "crash" is simulated by inserting a partially-driven saga row whose
//! lease belongs to a dead coordinator, with the participant side
//! effects that had already happened applied through the same
//! idempotency keys the original driver would have used.

use std::sync::Arc;
use std::time::Duration;

use common::{IdempotencyKey, SagaId};
use coordinator::{Config, SagaCoordinator};
use outbox::{InMemoryParticipantStore, ParticipantStore, RelayConfig};
use participant::{
    InventoryParticipant, OrderParticipant, ParticipantClient, PaymentParticipant,
};
use saga_core::{
    DefinitionRegistry, ErrorKind, RetryPolicy, SagaDefinition, SagaInstance, SagaStatus,
    StepDefinition, StepStatus,
};
use saga_log::{InMemorySagaLog, SagaLogStore};

fn definition() -> SagaDefinition {
    let retry = RetryPolicy {
        base_ms: 10,
        factor: 2,
        cap_ms: 80,
        max_attempts: 4,
    };
    SagaDefinition::new(
        "order-fulfillment",
        vec![
            StepDefinition::new("create_order", "order", "order.create")
                .with_compensation("order.cancel")
                .with_timeout(Duration::from_secs(1))
                .with_retry(retry.clone()),
            StepDefinition::new("reserve_inventory", "inventory", "inventory.reserve")
                .with_compensation("inventory.release")
                .with_timeout(Duration::from_secs(1))
                .with_retry(retry.clone()),
            StepDefinition::new("process_payment", "payment", "payment.charge")
                .with_compensation("payment.refund")
                .with_timeout(Duration::from_secs(1))
                .with_retry(retry),
        ],
    )
    .unwrap()
}

fn config(lease_ttl: Duration, heartbeat: Duration) -> Config {
    Config {
        lease_ttl,
        heartbeat,
        recovery_scan_interval: Duration::from_secs(60),
        relay: RelayConfig::default(),
        ..Config::default()
    }
}

fn order_input() -> serde_json::Value {
    serde_json::json!({"customer": "c1", "items": [{"p": "p1", "q": 2}], "total": 20.00})
}

struct Cluster {
    log: InMemorySagaLog,
    order: OrderParticipant<InMemoryParticipantStore>,
    inventory: InventoryParticipant<InMemoryParticipantStore>,
    payment: PaymentParticipant<InMemoryParticipantStore>,
    order_store: InMemoryParticipantStore,
    inventory_store: InMemoryParticipantStore,
}

impl Cluster {
    fn new() -> Self {
        let order_store = InMemoryParticipantStore::new();
        let inventory_store = InMemoryParticipantStore::new();
        Self {
            log: InMemorySagaLog::new(),
            order: OrderParticipant::new(order_store.clone()),
            inventory: InventoryParticipant::new(inventory_store.clone()),
            payment: PaymentParticipant::new(InMemoryParticipantStore::new()),
            order_store,
            inventory_store,
        }
    }

    /// Builds a coordinator over the shared log and participants,
    /// representing one process in the cluster.
    fn coordinator(&self, lease_ttl: Duration, heartbeat: Duration) -> SagaCoordinator<InMemorySagaLog> {
        let mut registry = DefinitionRegistry::new();
        registry.register(definition());
        SagaCoordinator::new(
            self.log.clone(),
            registry,
            vec![
                Arc::new(self.order.clone()) as Arc<dyn ParticipantClient>,
                Arc::new(self.inventory.clone()),
                Arc::new(self.payment.clone()),
            ],
            None,
            config(lease_ttl, heartbeat),
        )
    }

    async fn await_terminal(
        &self,
        coordinator: &SagaCoordinator<InMemorySagaLog>,
        saga_id: SagaId,
    ) -> SagaInstance {
        for _ in 0..500 {
            let saga = coordinator.status(saga_id).await.unwrap();
            if saga.is_terminal() {
                return saga;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("saga {saga_id} did not reach a terminal status");
    }
}

/// S4: the coordinator died after create_order was logged OK but before
/// reserve_inventory was invoked.
#[tokio::test]
async fn crash_between_steps_resumes_to_completion() {
    let cluster = Cluster::new();

    let mut saga = SagaInstance::new(&definition(), order_input(), None, None);
    let saga_id = saga.saga_id;
    saga.touch_lease("coordinator-dead", Duration::from_millis(0));
    saga.start_running().unwrap();
    saga.begin_step(0).unwrap();
    let key = IdempotencyKey::for_step(saga_id, 0);
    let handle = cluster
        .order
        .invoke("order.create", &key, &order_input())
        .await
        .unwrap();
    saga.record_step_ok(0, handle.clone(), 1).unwrap();
    cluster.log.insert(&saga).await.unwrap();

    let coordinator = cluster.coordinator(Duration::from_secs(5), Duration::from_millis(50));
    let resumed = coordinator.recover().await.unwrap();
    assert_eq!(resumed, 1);

    let saga = cluster.await_terminal(&coordinator, saga_id).await;
    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(saga.step_results[0].handle.as_deref(), Some(handle.as_str()));

    // The idempotency key kept the order effect single: one business
    // row, one OrderCreated event, despite the re-driven saga.
    assert_eq!(cluster.order.created_count(), 1);
    assert_eq!(cluster.order_store.business_count(), 1);
    assert_eq!(cluster.order_store.event_types(), vec!["OrderCreated"]);
    assert_eq!(cluster.inventory.invoke_attempts(), 1);
    assert_eq!(cluster.payment.charged_count(), 1);

    coordinator.shutdown().await;
}

/// The coordinator died mid-invocation: the step is PENDING in the log
/// and the participant already applied the effect.
#[tokio::test]
async fn crash_mid_invocation_reinvokes_with_same_key() {
    let cluster = Cluster::new();

    let mut saga = SagaInstance::new(&definition(), order_input(), None, None);
    let saga_id = saga.saga_id;
    saga.touch_lease("coordinator-dead", Duration::from_millis(0));
    saga.start_running().unwrap();
    saga.begin_step(0).unwrap();
    let order_handle = cluster
        .order
        .invoke(
            "order.create",
            &IdempotencyKey::for_step(saga_id, 0),
            &order_input(),
        )
        .await
        .unwrap();
    saga.record_step_ok(0, order_handle, 1).unwrap();

    // Step 1 began and took effect, but its OK was never logged.
    saga.begin_step(1).unwrap();
    let reservation = cluster
        .inventory
        .invoke(
            "inventory.reserve",
            &IdempotencyKey::for_step(saga_id, 1),
            &order_input(),
        )
        .await
        .unwrap();
    cluster.log.insert(&saga).await.unwrap();

    let coordinator = cluster.coordinator(Duration::from_secs(5), Duration::from_millis(50));
    coordinator.recover().await.unwrap();
    let saga = cluster.await_terminal(&coordinator, saga_id).await;

    assert_eq!(saga.status, SagaStatus::Completed);
    // The re-invocation deduplicated to the original reservation.
    assert_eq!(
        saga.step_results[1].handle.as_deref(),
        Some(reservation.as_str())
    );
    assert_eq!(cluster.inventory.invoke_attempts(), 2);
    assert_eq!(cluster.inventory.active_reservations(), 1);
    assert_eq!(cluster.inventory_store.event_types(), vec!["InventoryReserved"]);

    coordinator.shutdown().await;
}

/// The coordinator died after entering COMPENSATING.
#[tokio::test]
async fn crash_during_compensation_resumes_compensation() {
    let cluster = Cluster::new();

    let mut saga = SagaInstance::new(&definition(), order_input(), None, None);
    let saga_id = saga.saga_id;
    saga.touch_lease("coordinator-dead", Duration::from_millis(0));
    saga.start_running().unwrap();

    saga.begin_step(0).unwrap();
    let order_handle = cluster
        .order
        .invoke(
            "order.create",
            &IdempotencyKey::for_step(saga_id, 0),
            &order_input(),
        )
        .await
        .unwrap();
    saga.record_step_ok(0, order_handle.clone(), 1).unwrap();

    saga.begin_step(1).unwrap();
    let reservation = cluster
        .inventory
        .invoke(
            "inventory.reserve",
            &IdempotencyKey::for_step(saga_id, 1),
            &order_input(),
        )
        .await
        .unwrap();
    saga.record_step_ok(1, reservation, 1).unwrap();

    saga.begin_step(2).unwrap();
    saga.record_step_failed(2, ErrorKind::Business, "payment declined", 1)
        .unwrap();
    saga.begin_compensation("payment declined").unwrap();
    cluster.log.insert(&saga).await.unwrap();

    let coordinator = cluster.coordinator(Duration::from_secs(5), Duration::from_millis(50));
    coordinator.recover().await.unwrap();
    let saga = cluster.await_terminal(&coordinator, saga_id).await;

    assert_eq!(saga.status, SagaStatus::Compensated);
    assert_eq!(saga.step_results[0].status, StepStatus::Compensated);
    assert_eq!(saga.step_results[1].status, StepStatus::Compensated);
    assert_eq!(cluster.inventory.active_reservations(), 0);

    let order = cluster
        .order_store
        .get_business(&order_handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.data["status"], "cancelled");

    coordinator.shutdown().await;
}

/// An unexpired lease held by a live coordinator is never claimed.
#[tokio::test]
async fn recovery_skips_live_leases() {
    let cluster = Cluster::new();

    let mut saga = SagaInstance::new(&definition(), order_input(), None, None);
    saga.touch_lease("coordinator-alive", Duration::from_secs(60));
    saga.start_running().unwrap();
    cluster.log.insert(&saga).await.unwrap();

    let coordinator = cluster.coordinator(Duration::from_secs(5), Duration::from_millis(50));
    let resumed = coordinator.recover().await.unwrap();
    assert_eq!(resumed, 0);

    coordinator.shutdown().await;
}

/// Graceful shutdown pauses between steps; a second coordinator picks
/// the saga up and finishes it.
#[tokio::test]
async fn shutdown_pauses_saga_for_successor() {
    let cluster = Cluster::new();
    cluster
        .inventory
        .set_invoke_delay(Some(Duration::from_millis(150)));

    let c1 = cluster.coordinator(Duration::from_secs(5), Duration::from_millis(50));
    let saga_id = c1
        .submit("order-fulfillment", order_input(), Default::default())
        .await
        .unwrap();

    // create_order is done and reserve_inventory is in flight.
    tokio::time::sleep(Duration::from_millis(50)).await;
    c1.shutdown().await;

    // The in-flight call finished, its result was persisted, and the
    // saga paused non-terminal with the lease released.
    let paused = cluster.log.get(saga_id).await.unwrap().unwrap();
    assert_eq!(paused.status, SagaStatus::Running);
    assert_eq!(paused.current_step_index, 2);
    assert!(paused.owner_id.is_none());
    assert_eq!(cluster.payment.invoke_attempts(), 0);

    // A successor completes it from where the log left off.
    cluster.inventory.set_invoke_delay(None);
    let c2 = cluster.coordinator(Duration::from_secs(5), Duration::from_millis(50));
    c2.recover().await.unwrap();
    let saga = cluster.await_terminal(&c2, saga_id).await;

    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(cluster.inventory.invoke_attempts(), 1);
    assert_eq!(cluster.payment.invoke_attempts(), 1);

    c2.shutdown().await;
}

/// The heartbeat renews the lease during a slow adapter call, so a
/// second coordinator cannot steal the saga mid-invocation.
#[tokio::test]
async fn heartbeat_keeps_lease_alive_during_slow_call() {
    let cluster = Cluster::new();
    cluster
        .inventory
        .set_invoke_delay(Some(Duration::from_millis(300)));

    let c1 = cluster.coordinator(Duration::from_millis(100), Duration::from_millis(25));
    let saga_id = c1
        .submit("order-fulfillment", order_input(), Default::default())
        .await
        .unwrap();

    // Well past the original lease TTL, mid-invocation.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let c2 = cluster.coordinator(Duration::from_millis(100), Duration::from_millis(25));
    let stolen = c2.recover().await.unwrap();
    assert_eq!(stolen, 0, "heartbeat must keep the lease unexpired");

    let saga = cluster.await_terminal(&c1, saga_id).await;
    assert_eq!(saga.status, SagaStatus::Completed);
    // Exactly one driver invoked each participant.
    assert_eq!(cluster.inventory.invoke_attempts(), 1);
    assert_eq!(cluster.payment.invoke_attempts(), 1);

    c1.shutdown().await;
    c2.shutdown().await;
}
