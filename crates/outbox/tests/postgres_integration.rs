//! The participant co-write and relay-side row operations against
//! PostgreSQL.
//!
//! Each test boots its own throwaway Postgres container, runs the crate
//! migrations through [`PostgresParticipantStore::run_migrations`], and
//! verifies the outbox contract: a business upsert and its event insert
//! land together, delivery marking is one-shot, and repeated publish
//! failures park a row as DEAD. The container is torn down when the
//! test's guard drops. Requires a local Docker daemon; tests run
//! serially to keep the container churn bounded.

use outbox::{BusinessRecord, OutboxRow, OutboxStatus, ParticipantStore, PostgresParticipantStore};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;

/// Starts a disposable Postgres instance and returns a migrated
/// participant store over it. The container lives exactly as long as
/// the returned guard.
async fn participant_store_on_postgres() -> (ContainerAsync<Postgres>, PostgresParticipantStore) {
    let pg = Postgres::default()
        .start()
        .await
        .expect("start postgres container");
    let host = pg.get_host().await.expect("container host");
    let port = pg
        .get_host_port_ipv4(5432.tcp())
        .await
        .expect("mapped postgres port");

    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");
    let pool = PgPool::connect(&url).await.expect("connect to postgres");

    let store = PostgresParticipantStore::new(pool);
    store.run_migrations().await.expect("run outbox migrations");
    (pg, store)
}

fn order_pair(id: &str) -> (BusinessRecord, OutboxRow) {
    (
        BusinessRecord::new(id, "order", serde_json::json!({"status": "created"})),
        OutboxRow::new("Order", id, "OrderCreated", serde_json::json!({"id": id})),
    )
}

#[tokio::test]
#[serial]
async fn commit_writes_business_and_event_together() {
    let (_pg, store) = participant_store_on_postgres().await;
    let (business, event) = order_pair("PG-ORD-1");
    let event_id = event.event_id;

    store.commit(business, event).await.unwrap();

    let loaded = store.get_business("PG-ORD-1").await.unwrap().unwrap();
    assert_eq!(loaded.kind, "order");

    let pending = store.fetch_pending(100).await.unwrap();
    assert!(pending.iter().any(|r| r.event_id == event_id));
}

#[tokio::test]
#[serial]
async fn commit_upserts_business_record() {
    let (_pg, store) = participant_store_on_postgres().await;
    let (business, event) = order_pair("PG-ORD-2");
    store.commit(business, event).await.unwrap();

    let updated = BusinessRecord::new(
        "PG-ORD-2",
        "order",
        serde_json::json!({"status": "cancelled"}),
    );
    let cancel_event = OutboxRow::new(
        "Order",
        "PG-ORD-2",
        "OrderCancelled",
        serde_json::json!({"id": "PG-ORD-2"}),
    );
    store.commit(updated, cancel_event).await.unwrap();

    let loaded = store.get_business("PG-ORD-2").await.unwrap().unwrap();
    assert_eq!(loaded.data["status"], "cancelled");
}

#[tokio::test]
#[serial]
async fn mark_delivered_sets_status_once() {
    let (_pg, store) = participant_store_on_postgres().await;
    let (business, event) = order_pair("PG-ORD-3");
    let event_id = event.event_id;
    store.commit(business, event).await.unwrap();

    store.mark_delivered(event_id).await.unwrap();
    store.mark_delivered(event_id).await.unwrap();

    let pending = store.fetch_pending(100).await.unwrap();
    assert!(!pending.iter().any(|r| r.event_id == event_id));
}

#[tokio::test]
#[serial]
async fn publish_failures_park_row_as_dead() {
    let (_pg, store) = participant_store_on_postgres().await;
    let (business, event) = order_pair("PG-ORD-4");
    let event_id = event.event_id;
    store.commit(business, event).await.unwrap();

    assert_eq!(
        store.record_publish_failure(event_id, 2).await.unwrap(),
        OutboxStatus::Pending
    );
    assert_eq!(
        store.record_publish_failure(event_id, 2).await.unwrap(),
        OutboxStatus::Dead
    );

    // Settled rows report their status without further mutation.
    assert_eq!(
        store.record_publish_failure(event_id, 2).await.unwrap(),
        OutboxStatus::Dead
    );
}
