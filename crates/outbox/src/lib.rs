//! Transactional outbox: per-participant atomic co-write of a business
//! record and an event record, plus the background relay that publishes
//! pending events to the bus and marks them delivered.
//!
//! The invariant the outbox restores is atomicity between state change
//! and event emission: an event row exists iff its business effect is
//! committed, because both land in the same local transaction. Delivery
//! to the bus is then at-least-once; consumers deduplicate on `event_id`.

pub mod memory;
pub mod postgres;
pub mod relay;
pub mod row;
pub mod store;

use common::EventId;
use thiserror::Error;

pub use memory::InMemoryParticipantStore;
pub use postgres::PostgresParticipantStore;
pub use relay::{OutboxRelay, RelayConfig};
pub use row::{OutboxRow, OutboxStatus};
pub use store::{BusinessRecord, ParticipantStore};

/// Errors that can occur on participant storage.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The co-writing transaction did not commit; neither the business
    /// row nor the event row exists.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    /// No outbox row exists under the given event ID.
    #[error("outbox row not found: {0}")]
    RowNotFound(EventId),

    /// A database error occurred.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;
