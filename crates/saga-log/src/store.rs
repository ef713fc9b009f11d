use std::time::Duration;

use async_trait::async_trait;
use common::SagaId;
use saga_core::SagaInstance;

use crate::Result;

/// Core trait for saga log implementations.
///
/// The log stores one row per saga under its `saga_id` key and must
/// guarantee read-after-write and atomic replacement of that row. It does
/// not arbitrate concurrent drivers beyond lease fencing: `save` and
/// `renew_lease` succeed only for the owner named in the stored row, and
/// `claim` hands a saga over only once the previous lease expired.
#[async_trait]
pub trait SagaLogStore: Send + Sync {
    /// Inserts a newly-submitted saga.
    ///
    /// Fails with `AlreadyExists` on a duplicate `saga_id` and with
    /// `DuplicateRequest` when the instance carries a
    /// `client_request_id` already mapped to another saga.
    async fn insert(&self, saga: &SagaInstance) -> Result<()>;

    /// Retrieves a saga by ID.
    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaInstance>>;

    /// Looks up a saga by its submit idempotency key.
    async fn find_by_client_request(
        &self,
        client_request_id: &str,
    ) -> Result<Option<SagaInstance>>;

    /// Atomically replaces the stored row with `saga`.
    ///
    /// `owner` must match the `owner_id` currently stored, otherwise the
    /// write is rejected with `LeaseLost`. Callers refresh the lease on
    /// the instance before saving, so every successful write extends it.
    async fn save(&self, saga: &SagaInstance, owner: &str) -> Result<()>;

    /// Extends the lease held by `owner` without touching the rest of
    /// the row. Used by the heartbeat during long adapter calls.
    async fn renew_lease(&self, saga_id: SagaId, owner: &str, ttl: Duration) -> Result<()>;

    /// Claims the saga for `owner`, succeeding when the lease is absent,
    /// expired, or already held by `owner`. Returns the updated row.
    async fn claim(&self, saga_id: SagaId, owner: &str, ttl: Duration) -> Result<SagaInstance>;

    /// Releases the lease held by `owner`, if any.
    async fn release(&self, saga_id: SagaId, owner: &str) -> Result<()>;

    /// Enumerates every saga not in a terminal status, oldest first.
    /// Drives the recovery scan.
    async fn scan_non_terminal(&self) -> Result<Vec<SagaInstance>>;
}
