use common::SagaId;
use saga_core::TransitionError;
use saga_log::SagaLogError;
use thiserror::Error;

/// Errors that can occur during coordinator operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// No definition is registered under this id.
    #[error("definition not found: {0}")]
    DefinitionNotFound(String),

    /// No saga exists under this id.
    #[error("saga not found: {0}")]
    SagaNotFound(SagaId),

    /// A step names a participant this coordinator has no client for.
    #[error("unknown participant '{service}' for step '{step}'")]
    UnknownParticipant { service: String, step: String },

    /// The coordinator no longer accepts submissions.
    #[error("coordinator is shutting down")]
    ShuttingDown,

    /// A saga state machine transition was rejected.
    #[error("invalid saga transition: {0}")]
    InvalidTransition(#[from] TransitionError),

    /// Saga log error.
    #[error("saga log error: {0}")]
    Log(#[from] SagaLogError),
}

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;
