use common::SagaId;
use thiserror::Error;

/// Errors that can occur when interacting with the saga log.
#[derive(Debug, Error)]
pub enum SagaLogError {
    /// No saga exists under the given ID.
    #[error("saga not found: {0}")]
    NotFound(SagaId),

    /// A saga with this ID was already inserted.
    #[error("saga already exists: {0}")]
    AlreadyExists(SagaId),

    /// A saga was already submitted under this client request key.
    /// Carries the existing saga so the caller can return it.
    #[error("client request '{client_request_id}' already mapped to saga {saga_id}")]
    DuplicateRequest {
        client_request_id: String,
        saga_id: SagaId,
    },

    /// A write was rejected because the caller no longer holds the lease.
    #[error("lease on saga {saga_id} is held by '{held_by}'")]
    LeaseLost { saga_id: SagaId, held_by: String },

    /// A claim was refused because another coordinator holds an
    /// unexpired lease.
    #[error("saga {saga_id} is leased to '{held_by}'")]
    LeaseHeld { saga_id: SagaId, held_by: String },

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

/// Result type for saga log operations.
pub type Result<T> = std::result::Result<T, SagaLogError>;
