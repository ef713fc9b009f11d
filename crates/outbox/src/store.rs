use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EventId;
use serde::{Deserialize, Serialize};

use crate::row::{OutboxRow, OutboxStatus};
use crate::Result;

/// A participant-owned business row, written in the same transaction as
/// its outbox event.
///
/// The coordinator never sees these; the shape is deliberately loose
/// because each participant owns its own schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessRecord {
    /// Primary key within the participant (order id, reservation id, ...).
    pub id: String,
    /// Record kind (e.g. "order", "reservation", "payment").
    pub kind: String,
    /// Participant-defined record body.
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl BusinessRecord {
    /// Creates a record stamped with the current time.
    pub fn new(id: impl Into<String>, kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            data,
            updated_at: Utc::now(),
        }
    }
}

/// Storage owned by a single participant: its business table plus its
/// outbox table, mutated together.
///
/// `commit` is the heart of the outbox pattern: the business upsert and
/// the event insert happen in one local transaction, so no event exists
/// without its business effect and vice versa. The relay-side methods
/// (`fetch_pending`, `mark_delivered`, `record_publish_failure`) are
/// single-row operations and never touch business data.
#[async_trait]
pub trait ParticipantStore: Send + Sync {
    /// Atomically upserts the business record and inserts the event row.
    async fn commit(&self, business: BusinessRecord, event: OutboxRow) -> Result<()>;

    /// Fetches up to `limit` pending rows ordered by `created_at`,
    /// ties broken by `event_id`.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxRow>>;

    /// Marks a pending row delivered, setting `delivered_at` once.
    /// Already-delivered rows are left untouched.
    async fn mark_delivered(&self, event_id: EventId) -> Result<()>;

    /// Bumps the attempt count after a failed publish; the row goes
    /// `DEAD` once `dead_after` attempts are reached. Returns the
    /// resulting status.
    async fn record_publish_failure(
        &self,
        event_id: EventId,
        dead_after: u32,
    ) -> Result<OutboxStatus>;

    /// Looks up a business record by ID.
    async fn get_business(&self, id: &str) -> Result<Option<BusinessRecord>>;
}
