use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use common::EventId;

use crate::row::{OutboxRow, OutboxStatus};
use crate::store::{BusinessRecord, ParticipantStore};
use crate::{OutboxError, Result};

#[derive(Debug, Default)]
struct State {
    business: HashMap<String, BusinessRecord>,
    outbox: Vec<OutboxRow>,
    fail_next_commits: u32,
}

/// In-memory participant storage for testing.
///
/// Both tables live behind one mutex, so the business/event co-write is
/// atomic by construction: an injected failure aborts before either
/// write, mirroring a rolled-back database transaction.
#[derive(Debug, Clone, Default)]
pub struct InMemoryParticipantStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryParticipantStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits abort before writing anything.
    pub fn fail_next_commits(&self, count: u32) {
        self.state.lock().unwrap().fail_next_commits = count;
    }

    /// Returns the number of business records.
    pub fn business_count(&self) -> usize {
        self.state.lock().unwrap().business.len()
    }

    /// Returns all outbox rows in insertion order.
    pub fn outbox_rows(&self) -> Vec<OutboxRow> {
        self.state.lock().unwrap().outbox.clone()
    }

    /// Returns the number of rows with the given status.
    pub fn count_with_status(&self, status: OutboxStatus) -> usize {
        self.state
            .lock()
            .unwrap()
            .outbox
            .iter()
            .filter(|r| r.status == status)
            .count()
    }

    /// Returns the outbox rows for one aggregate, in insertion order.
    pub fn rows_for_aggregate(&self, aggregate_id: &str) -> Vec<OutboxRow> {
        self.state
            .lock()
            .unwrap()
            .outbox
            .iter()
            .filter(|r| r.aggregate_id == aggregate_id)
            .cloned()
            .collect()
    }

    /// Returns event types in insertion order, across all aggregates.
    pub fn event_types(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .outbox
            .iter()
            .map(|r| r.event_type.clone())
            .collect()
    }

    /// Counts business records that have no outbox row for their ID.
    ///
    /// Always zero when the co-write holds; exposed so tests can assert
    /// the invariant under fault injection.
    pub fn business_without_event_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .business
            .values()
            .filter(|b| !state.outbox.iter().any(|r| r.aggregate_id == b.id))
            .count()
    }
}

#[async_trait]
impl ParticipantStore for InMemoryParticipantStore {
    async fn commit(&self, business: BusinessRecord, event: OutboxRow) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if state.fail_next_commits > 0 {
            state.fail_next_commits -= 1;
            return Err(OutboxError::TransactionAborted(
                "injected crash at transaction boundary".to_string(),
            ));
        }

        state.business.insert(business.id.clone(), business);
        state.outbox.push(event);
        Ok(())
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxRow>> {
        let state = self.state.lock().unwrap();
        let mut pending: Vec<_> = state
            .outbox
            .iter()
            .filter(|r| r.status == OutboxStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.event_id.cmp(&b.event_id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_delivered(&self, event_id: EventId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .outbox
            .iter_mut()
            .find(|r| r.event_id == event_id)
            .ok_or(OutboxError::RowNotFound(event_id))?;

        if row.status == OutboxStatus::Pending {
            row.status = OutboxStatus::Delivered;
            row.delivered_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_publish_failure(
        &self,
        event_id: EventId,
        dead_after: u32,
    ) -> Result<OutboxStatus> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .outbox
            .iter_mut()
            .find(|r| r.event_id == event_id)
            .ok_or(OutboxError::RowNotFound(event_id))?;

        if row.status != OutboxStatus::Pending {
            return Ok(row.status);
        }

        row.attempt_count += 1;
        if row.attempt_count >= dead_after {
            row.status = OutboxStatus::Dead;
        }
        Ok(row.status)
    }

    async fn get_business(&self, id: &str) -> Result<Option<BusinessRecord>> {
        Ok(self.state.lock().unwrap().business.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_commit(id: &str) -> (BusinessRecord, OutboxRow) {
        let business = BusinessRecord::new(id, "order", serde_json::json!({"status": "created"}));
        let event = OutboxRow::new("Order", id, "OrderCreated", serde_json::json!({"id": id}));
        (business, event)
    }

    #[tokio::test]
    async fn commit_writes_both_tables() {
        let store = InMemoryParticipantStore::new();
        let (business, event) = order_commit("ORD-1");
        store.commit(business, event).await.unwrap();

        assert_eq!(store.business_count(), 1);
        assert_eq!(store.outbox_rows().len(), 1);
        assert_eq!(store.business_without_event_count(), 0);
    }

    #[tokio::test]
    async fn aborted_commit_writes_neither_table() {
        let store = InMemoryParticipantStore::new();
        store.fail_next_commits(1);

        let (business, event) = order_commit("ORD-1");
        let result = store.commit(business, event).await;
        assert!(matches!(result, Err(OutboxError::TransactionAborted(_))));

        assert_eq!(store.business_count(), 0);
        assert_eq!(store.outbox_rows().len(), 0);

        // Next commit goes through.
        let (business, event) = order_commit("ORD-1");
        store.commit(business, event).await.unwrap();
        assert_eq!(store.business_count(), 1);
    }

    #[tokio::test]
    async fn fetch_pending_orders_by_created_at_then_event_id() {
        let store = InMemoryParticipantStore::new();
        for i in 0..3 {
            let id = format!("ORD-{i}");
            let (business, event) = order_commit(&id);
            store.commit(business, event).await.unwrap();
        }

        let pending = store.fetch_pending(10).await.unwrap();
        assert_eq!(pending.len(), 3);
        for pair in pending.windows(2) {
            assert!(
                pair[0].created_at < pair[1].created_at
                    || (pair[0].created_at == pair[1].created_at
                        && pair[0].event_id < pair[1].event_id)
            );
        }

        let limited = store.fetch_pending(2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn mark_delivered_is_monotone() {
        let store = InMemoryParticipantStore::new();
        let (business, event) = order_commit("ORD-1");
        let event_id = event.event_id;
        store.commit(business, event).await.unwrap();

        store.mark_delivered(event_id).await.unwrap();
        let first = store.outbox_rows()[0].delivered_at.unwrap();

        store.mark_delivered(event_id).await.unwrap();
        assert_eq!(store.outbox_rows()[0].delivered_at.unwrap(), first);
        assert_eq!(store.count_with_status(OutboxStatus::Delivered), 1);
    }

    #[tokio::test]
    async fn publish_failures_accumulate_to_dead() {
        let store = InMemoryParticipantStore::new();
        let (business, event) = order_commit("ORD-1");
        let event_id = event.event_id;
        store.commit(business, event).await.unwrap();

        assert_eq!(
            store.record_publish_failure(event_id, 3).await.unwrap(),
            OutboxStatus::Pending
        );
        assert_eq!(
            store.record_publish_failure(event_id, 3).await.unwrap(),
            OutboxStatus::Pending
        );
        assert_eq!(
            store.record_publish_failure(event_id, 3).await.unwrap(),
            OutboxStatus::Dead
        );

        // Dead rows are no longer fetched.
        assert!(store.fetch_pending(10).await.unwrap().is_empty());
    }
}
