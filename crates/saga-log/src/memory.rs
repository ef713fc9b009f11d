use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::SagaId;
use saga_core::SagaInstance;
use tokio::sync::RwLock;

use crate::error::SagaLogError;
use crate::store::SagaLogStore;
use crate::Result;

#[derive(Default)]
struct State {
    sagas: HashMap<SagaId, SagaInstance>,
    by_request: HashMap<String, SagaId>,
}

/// In-memory saga log implementation for testing.
///
/// Provides the same lease-fencing semantics as the PostgreSQL
/// implementation.
#[derive(Clone, Default)]
pub struct InMemorySagaLog {
    state: Arc<RwLock<State>>,
}

impl InMemorySagaLog {
    /// Creates a new empty in-memory saga log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of sagas stored.
    pub async fn saga_count(&self) -> usize {
        self.state.read().await.sagas.len()
    }
}

#[async_trait]
impl SagaLogStore for InMemorySagaLog {
    async fn insert(&self, saga: &SagaInstance) -> Result<()> {
        let mut state = self.state.write().await;

        if state.sagas.contains_key(&saga.saga_id) {
            return Err(SagaLogError::AlreadyExists(saga.saga_id));
        }
        if let Some(key) = &saga.client_request_id
            && let Some(existing) = state.by_request.get(key)
        {
            return Err(SagaLogError::DuplicateRequest {
                client_request_id: key.clone(),
                saga_id: *existing,
            });
        }

        if let Some(key) = &saga.client_request_id {
            state.by_request.insert(key.clone(), saga.saga_id);
        }
        state.sagas.insert(saga.saga_id, saga.clone());
        Ok(())
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        Ok(self.state.read().await.sagas.get(&saga_id).cloned())
    }

    async fn find_by_client_request(
        &self,
        client_request_id: &str,
    ) -> Result<Option<SagaInstance>> {
        let state = self.state.read().await;
        Ok(state
            .by_request
            .get(client_request_id)
            .and_then(|id| state.sagas.get(id))
            .cloned())
    }

    async fn save(&self, saga: &SagaInstance, owner: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let stored = state
            .sagas
            .get_mut(&saga.saga_id)
            .ok_or(SagaLogError::NotFound(saga.saga_id))?;

        if stored.owner_id.as_deref() != Some(owner) {
            return Err(SagaLogError::LeaseLost {
                saga_id: saga.saga_id,
                held_by: stored.owner_id.clone().unwrap_or_else(|| "<none>".into()),
            });
        }

        *stored = saga.clone();
        Ok(())
    }

    async fn renew_lease(&self, saga_id: SagaId, owner: &str, ttl: Duration) -> Result<()> {
        let mut state = self.state.write().await;
        let stored = state
            .sagas
            .get_mut(&saga_id)
            .ok_or(SagaLogError::NotFound(saga_id))?;

        if stored.owner_id.as_deref() != Some(owner) {
            return Err(SagaLogError::LeaseLost {
                saga_id,
                held_by: stored.owner_id.clone().unwrap_or_else(|| "<none>".into()),
            });
        }

        stored.touch_lease(owner, ttl);
        Ok(())
    }

    async fn claim(&self, saga_id: SagaId, owner: &str, ttl: Duration) -> Result<SagaInstance> {
        let mut state = self.state.write().await;
        let stored = state
            .sagas
            .get_mut(&saga_id)
            .ok_or(SagaLogError::NotFound(saga_id))?;

        let now = Utc::now();
        let claimable =
            stored.owner_id.as_deref() == Some(owner) || stored.lease_expired(now);
        if !claimable {
            return Err(SagaLogError::LeaseHeld {
                saga_id,
                held_by: stored.owner_id.clone().unwrap_or_else(|| "<none>".into()),
            });
        }

        stored.touch_lease(owner, ttl);
        Ok(stored.clone())
    }

    async fn release(&self, saga_id: SagaId, owner: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(stored) = state.sagas.get_mut(&saga_id)
            && stored.owner_id.as_deref() == Some(owner)
        {
            stored.clear_lease();
        }
        Ok(())
    }

    async fn scan_non_terminal(&self) -> Result<Vec<SagaInstance>> {
        let state = self.state.read().await;
        let mut sagas: Vec<_> = state
            .sagas
            .values()
            .filter(|s| !s.is_terminal())
            .cloned()
            .collect();
        sagas.sort_by_key(|s| s.created_at);
        Ok(sagas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga_core::{SagaDefinition, SagaStatus, StepDefinition};

    fn definition() -> SagaDefinition {
        SagaDefinition::new(
            "order-fulfillment",
            vec![StepDefinition::new("create_order", "order", "order.create")],
        )
        .unwrap()
    }

    fn new_saga(request_id: Option<&str>) -> SagaInstance {
        SagaInstance::new(
            &definition(),
            serde_json::json!({"customer": "c1"}),
            request_id.map(String::from),
            None,
        )
    }

    #[tokio::test]
    async fn insert_and_get() {
        let log = InMemorySagaLog::new();
        let saga = new_saga(None);

        log.insert(&saga).await.unwrap();
        let loaded = log.get(saga.saga_id).await.unwrap().unwrap();
        assert_eq!(loaded.saga_id, saga.saga_id);
        assert_eq!(loaded.status, SagaStatus::Started);
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_id() {
        let log = InMemorySagaLog::new();
        let saga = new_saga(None);
        log.insert(&saga).await.unwrap();

        let result = log.insert(&saga).await;
        assert!(matches!(result, Err(SagaLogError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_client_request() {
        let log = InMemorySagaLog::new();
        let first = new_saga(Some("req-1"));
        log.insert(&first).await.unwrap();

        let second = new_saga(Some("req-1"));
        match log.insert(&second).await {
            Err(SagaLogError::DuplicateRequest { saga_id, .. }) => {
                assert_eq!(saga_id, first.saga_id);
            }
            other => panic!("expected DuplicateRequest, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn find_by_client_request() {
        let log = InMemorySagaLog::new();
        let saga = new_saga(Some("req-7"));
        log.insert(&saga).await.unwrap();

        let found = log.find_by_client_request("req-7").await.unwrap().unwrap();
        assert_eq!(found.saga_id, saga.saga_id);
        assert!(log.find_by_client_request("req-8").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_requires_lease() {
        let log = InMemorySagaLog::new();
        let mut saga = new_saga(None);
        saga.touch_lease("coord-a", Duration::from_secs(30));
        log.insert(&saga).await.unwrap();

        saga.start_running().unwrap();
        log.save(&saga, "coord-a").await.unwrap();

        let result = log.save(&saga, "coord-b").await;
        assert!(matches!(result, Err(SagaLogError::LeaseLost { .. })));
    }

    #[tokio::test]
    async fn claim_respects_unexpired_lease() {
        let log = InMemorySagaLog::new();
        let mut saga = new_saga(None);
        saga.touch_lease("coord-a", Duration::from_secs(30));
        log.insert(&saga).await.unwrap();

        // Holder may re-claim its own saga.
        log.claim(saga.saga_id, "coord-a", Duration::from_secs(30))
            .await
            .unwrap();

        // Another coordinator may not while the lease is live.
        let result = log
            .claim(saga.saga_id, "coord-b", Duration::from_secs(30))
            .await;
        assert!(matches!(result, Err(SagaLogError::LeaseHeld { .. })));
    }

    #[tokio::test]
    async fn claim_takes_over_expired_lease() {
        let log = InMemorySagaLog::new();
        let mut saga = new_saga(None);
        saga.touch_lease("coord-a", Duration::from_millis(0));
        log.insert(&saga).await.unwrap();

        let claimed = log
            .claim(saga.saga_id, "coord-b", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(claimed.owner_id.as_deref(), Some("coord-b"));
    }

    #[tokio::test]
    async fn release_clears_lease_for_owner_only() {
        let log = InMemorySagaLog::new();
        let mut saga = new_saga(None);
        saga.touch_lease("coord-a", Duration::from_secs(30));
        log.insert(&saga).await.unwrap();

        // Wrong owner is a no-op.
        log.release(saga.saga_id, "coord-b").await.unwrap();
        let stored = log.get(saga.saga_id).await.unwrap().unwrap();
        assert_eq!(stored.owner_id.as_deref(), Some("coord-a"));

        log.release(saga.saga_id, "coord-a").await.unwrap();
        let stored = log.get(saga.saga_id).await.unwrap().unwrap();
        assert!(stored.owner_id.is_none());
    }

    #[tokio::test]
    async fn scan_skips_terminal_sagas() {
        let log = InMemorySagaLog::new();

        let running = new_saga(None);
        log.insert(&running).await.unwrap();

        let mut done = new_saga(None);
        done.touch_lease("coord-a", Duration::from_secs(30));
        done.start_running().unwrap();
        done.begin_step(0).unwrap();
        done.record_step_ok(0, "H", 1).unwrap();
        done.complete().unwrap();
        log.insert(&done).await.unwrap();

        let scanned = log.scan_non_terminal().await.unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].saga_id, running.saga_id);
    }
}
