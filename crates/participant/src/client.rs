use async_trait::async_trait;
use common::IdempotencyKey;

use crate::error::ParticipantError;

/// Client-side contract of an external collaborator.
///
/// Both methods MUST be idempotent on the key: a repeated call with the
/// same key returns the original outcome without producing additional
/// side effects. The coordinator leans on this to tolerate its own
/// restart between "participant returned OK" and "state persisted".
#[async_trait]
pub trait ParticipantClient: Send + Sync {
    /// The participant name step definitions refer to via `service`.
    fn name(&self) -> &str;

    /// Executes a forward operation, returning the participant's opaque
    /// handle (order id, reservation id, payment id).
    async fn invoke(
        &self,
        target: &str,
        key: &IdempotencyKey,
        payload: &serde_json::Value,
    ) -> Result<String, ParticipantError>;

    /// Undoes a previously-completed operation identified by its handle.
    async fn compensate(
        &self,
        target: &str,
        key: &IdempotencyKey,
        handle: &str,
    ) -> Result<(), ParticipantError>;
}
