//! The outbox row model.

use chrono::{DateTime, Utc};
use common::EventId;
use serde::{Deserialize, Serialize};

/// Delivery status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Not yet published to the bus.
    #[default]
    Pending,

    /// Published and acknowledged; never reverts.
    Delivered,

    /// Exceeded the publish attempt threshold; parked for operator triage.
    Dead,
}

impl OutboxStatus {
    /// Returns the status name as stored in the outbox table.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Delivered => "DELIVERED",
            OutboxStatus::Dead => "DEAD",
        }
    }

    /// Parses a status from its table representation.
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OutboxStatus::Pending),
            "DELIVERED" => Some(OutboxStatus::Delivered),
            "DEAD" => Some(OutboxStatus::Dead),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One event awaiting (or past) publication, co-written with the business
/// mutation it describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    /// Globally unique; the consumer deduplication key.
    pub event_id: EventId,
    /// Aggregate type for routing (e.g. "Order").
    pub aggregate_type: String,
    /// Partition key on the bus; per-aggregate publish order is FIFO.
    pub aggregate_id: String,
    /// Event type name (e.g. "OrderCreated").
    pub event_type: String,
    /// Opaque payload, format chosen by the participant.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Set exactly once, when the publish is acknowledged.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Publish attempts so far.
    pub attempt_count: u32,
    pub status: OutboxStatus,
}

impl OutboxRow {
    /// Creates a pending row for a freshly-produced event.
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            created_at: Utc::now(),
            delivered_at: None,
            attempt_count: 0,
            status: OutboxStatus::Pending,
        }
    }

    /// Converts the row into its bus representation.
    pub fn to_bus_message(&self) -> event_bus::BusMessage {
        event_bus::BusMessage {
            key: self.aggregate_id.clone(),
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            aggregate_type: self.aggregate_type.clone(),
            created_at: self.created_at,
            payload: self.payload.clone(),
        }
    }
}
