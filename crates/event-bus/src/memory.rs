//! In-memory event bus for testing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::EventId;

use crate::{BusMessage, EventBus, EventBusError, Result};

#[derive(Debug, Default)]
struct InMemoryBusState {
    messages: Vec<BusMessage>,
    by_key: HashMap<String, Vec<EventId>>,
    fail_remaining: u32,
    fail_always: bool,
}

/// In-memory event bus for testing.
///
/// Records every accepted message in publish order, tracks per-key
/// delivery order, and supports failure injection so tests can exercise
/// the relay's retry path.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventBus {
    state: Arc<RwLock<InMemoryBusState>>,
}

impl InMemoryEventBus {
    /// Creates a new in-memory event bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.write().unwrap().fail_remaining = count;
    }

    /// Configures the bus to fail every publish until cleared.
    pub fn set_fail_publish(&self, fail: bool) {
        self.state.write().unwrap().fail_always = fail;
    }

    /// Returns the number of accepted messages.
    pub fn published_count(&self) -> usize {
        self.state.read().unwrap().messages.len()
    }

    /// Returns all accepted messages in publish order.
    pub fn messages(&self) -> Vec<BusMessage> {
        self.state.read().unwrap().messages.clone()
    }

    /// Returns the event IDs delivered for one key, in publish order.
    pub fn deliveries_for_key(&self, key: &str) -> Vec<EventId> {
        self.state
            .read()
            .unwrap()
            .by_key
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns event types accepted for one key, in publish order.
    pub fn event_types_for_key(&self, key: &str) -> Vec<String> {
        self.state
            .read()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.key == key)
            .map(|m| m.event_type.clone())
            .collect()
    }

    /// Returns event types across all keys, in publish order.
    pub fn event_types(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap()
            .messages
            .iter()
            .map(|m| m.event_type.clone())
            .collect()
    }

    /// Counts how many accepted messages carry the given event ID.
    ///
    /// At-least-once delivery means duplicates are legal; consumers are
    /// expected to collapse them on this ID.
    pub fn delivery_count(&self, event_id: EventId) -> usize {
        self.state
            .read()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.event_id == event_id)
            .count()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, message: BusMessage) -> Result<()> {
        let mut state = self.state.write().unwrap();

        if state.fail_always {
            return Err(EventBusError::PublishFailed("bus unavailable".to_string()));
        }
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(EventBusError::PublishFailed(
                "injected publish failure".to_string(),
            ));
        }

        state
            .by_key
            .entry(message.key.clone())
            .or_default()
            .push(message.event_id);
        state.messages.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(key: &str, event_type: &str) -> BusMessage {
        BusMessage {
            key: key.to_string(),
            event_id: EventId::new(),
            event_type: event_type.to_string(),
            aggregate_type: "Order".to_string(),
            created_at: Utc::now(),
            payload: serde_json::json!({"ok": true}),
        }
    }

    #[tokio::test]
    async fn publish_records_message_and_key_order() {
        let bus = InMemoryEventBus::new();
        let m1 = message("ORD-1", "OrderCreated");
        let m2 = message("ORD-1", "OrderCancelled");
        let id1 = m1.event_id;
        let id2 = m2.event_id;

        bus.publish(m1).await.unwrap();
        bus.publish(m2).await.unwrap();

        assert_eq!(bus.published_count(), 2);
        assert_eq!(bus.deliveries_for_key("ORD-1"), vec![id1, id2]);
        assert_eq!(
            bus.event_types_for_key("ORD-1"),
            vec!["OrderCreated", "OrderCancelled"]
        );
    }

    #[tokio::test]
    async fn fail_next_publishes_then_recovers() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes(2);

        assert!(bus.publish(message("A", "E1")).await.is_err());
        assert!(bus.publish(message("A", "E2")).await.is_err());
        assert!(bus.publish(message("A", "E3")).await.is_ok());
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn fail_always_until_cleared() {
        let bus = InMemoryEventBus::new();
        bus.set_fail_publish(true);
        assert!(bus.publish(message("A", "E1")).await.is_err());

        bus.set_fail_publish(false);
        assert!(bus.publish(message("A", "E1")).await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_event_ids_are_counted() {
        let bus = InMemoryEventBus::new();
        let m = message("A", "E1");
        let id = m.event_id;

        bus.publish(m.clone()).await.unwrap();
        bus.publish(m).await.unwrap();

        assert_eq!(bus.delivery_count(id), 2);
    }
}
