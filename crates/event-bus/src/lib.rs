//! Event bus adapter: at-least-once publish with per-key ordering.
//!
//! The bus is an opaque sink from the relay's point of view. Messages are
//! keyed by aggregate ID (the partition key), and headers carry the event
//! metadata consumers need to deduplicate (`event_id`) and route
//! (`event_type`, `aggregate_type`, `created_at`).

pub mod kafka;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EventId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use kafka::{KafkaConfig, KafkaEventBus};
pub use memory::InMemoryEventBus;

/// A message published to the bus.
///
/// `key` is the aggregate ID: the bus preserves publish order between
/// messages that share a key, and makes no promise across keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    /// Partition key (the aggregate ID).
    pub key: String,
    /// Consumer deduplication key.
    pub event_id: EventId,
    /// Event type name (e.g. "OrderCreated").
    pub event_type: String,
    /// Aggregate type name (e.g. "Order").
    pub aggregate_type: String,
    /// When the producing participant created the event.
    pub created_at: DateTime<Utc>,
    /// Opaque event payload, format chosen by the participant.
    pub payload: serde_json::Value,
}

/// Errors raised by bus implementations.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// The bus refused or failed the publish; the caller may retry.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// The payload could not be serialized for the wire.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, EventBusError>;

/// A publish/subscribe sink with at-least-once delivery.
///
/// Implementations must not reorder two messages with the same `key`.
/// Duplicate publishes are expected; consumers deduplicate on `event_id`.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes one message. Returning `Ok` means the bus has durably
    /// accepted the message (at-least-once from here on).
    async fn publish(&self, message: BusMessage) -> Result<()>;
}
