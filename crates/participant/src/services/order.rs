//! In-memory order service participant.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::IdempotencyKey;
use outbox::{BusinessRecord, OutboxRow, ParticipantStore};
use saga_core::ErrorKind;

use crate::client::ParticipantClient;
use crate::error::ParticipantError;
use crate::services::CallJournal;

const TARGET_CREATE: &str = "order.create";
const TARGET_CANCEL: &str = "order.cancel";

#[derive(Debug, Default)]
struct OrderState {
    /// Idempotency key -> handle returned for that key.
    outcomes: HashMap<String, String>,
    /// Compensation keys already applied.
    compensated: HashSet<String>,
    /// Failures consumed one per invoke attempt.
    scripted_failures: VecDeque<ErrorKind>,
    /// Persistent compensation failure, until cleared.
    fail_compensation: Option<ErrorKind>,
    invoke_attempts: u32,
    compensate_attempts: u32,
    next_id: u32,
}

/// In-memory order participant.
///
/// `order.create` writes an order row and an `OrderCreated` event in one
/// store transaction; `order.cancel` flips the row and emits
/// `OrderCancelled`.
#[derive(Clone)]
pub struct OrderParticipant<S> {
    store: S,
    journal: CallJournal,
    state: Arc<Mutex<OrderState>>,
}

impl<S: ParticipantStore> OrderParticipant<S> {
    /// Creates an order participant over the given store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            journal: CallJournal::new(),
            state: Arc::new(Mutex::new(OrderState::default())),
        }
    }

    /// Uses a shared journal so tests can observe cross-participant order.
    pub fn with_journal(mut self, journal: CallJournal) -> Self {
        self.journal = journal;
        self
    }

    /// Queues `count` invoke attempts to fail with `kind`.
    pub fn fail_invoke_times(&self, kind: ErrorKind, count: u32) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.scripted_failures.push_back(kind);
        }
    }

    /// Makes every compensation fail with `kind` until cleared.
    pub fn set_fail_compensation(&self, kind: Option<ErrorKind>) {
        self.state.lock().unwrap().fail_compensation = kind;
    }

    /// Attempts observed on `order.create`, including scripted failures.
    pub fn invoke_attempts(&self) -> u32 {
        self.state.lock().unwrap().invoke_attempts
    }

    /// Attempts observed on `order.cancel`.
    pub fn compensate_attempts(&self) -> u32 {
        self.state.lock().unwrap().compensate_attempts
    }

    /// Number of distinct orders created.
    pub fn created_count(&self) -> usize {
        self.state.lock().unwrap().outcomes.len()
    }
}

#[async_trait]
impl<S: ParticipantStore + Clone + Send + Sync + 'static> ParticipantClient
    for OrderParticipant<S>
{
    fn name(&self) -> &str {
        "order"
    }

    async fn invoke(
        &self,
        target: &str,
        key: &IdempotencyKey,
        payload: &serde_json::Value,
    ) -> Result<String, ParticipantError> {
        if target != TARGET_CREATE {
            return Err(ParticipantError::new(
                ErrorKind::FatalInternal,
                format!("order participant has no target '{target}'"),
            ));
        }

        self.journal.record(target);
        let handle = {
            let mut state = self.state.lock().unwrap();
            state.invoke_attempts += 1;

            // Repeated key: return the original handle, no new side effect.
            if let Some(handle) = state.outcomes.get(key.as_str()) {
                return Ok(handle.clone());
            }
            if let Some(kind) = state.scripted_failures.pop_front() {
                return Err(ParticipantError::new(kind, "scripted order failure"));
            }

            state.next_id += 1;
            format!("ORD-{:04}", state.next_id)
        };

        self.store
            .commit(
                BusinessRecord::new(
                    &handle,
                    "order",
                    serde_json::json!({"status": "created", "request": payload}),
                ),
                OutboxRow::new("Order", &handle, "OrderCreated", payload.clone()),
            )
            .await
            .map_err(|e| ParticipantError::transient(e.to_string()))?;

        self.state
            .lock()
            .unwrap()
            .outcomes
            .insert(key.as_str().to_string(), handle.clone());
        Ok(handle)
    }

    async fn compensate(
        &self,
        target: &str,
        key: &IdempotencyKey,
        handle: &str,
    ) -> Result<(), ParticipantError> {
        if target != TARGET_CANCEL {
            return Err(ParticipantError::new(
                ErrorKind::FatalInternal,
                format!("order participant has no compensation '{target}'"),
            ));
        }

        self.journal.record(target);
        {
            let mut state = self.state.lock().unwrap();
            state.compensate_attempts += 1;

            if state.compensated.contains(key.as_str()) {
                return Ok(());
            }
            if let Some(kind) = state.fail_compensation {
                return Err(ParticipantError::new(kind, "scripted cancel failure"));
            }
        }

        self.store
            .commit(
                BusinessRecord::new(
                    handle,
                    "order",
                    serde_json::json!({"status": "cancelled"}),
                ),
                OutboxRow::new(
                    "Order",
                    handle,
                    "OrderCancelled",
                    serde_json::json!({"order_id": handle}),
                ),
            )
            .await
            .map_err(|e| ParticipantError::transient(e.to_string()))?;

        self.state
            .lock()
            .unwrap()
            .compensated
            .insert(key.as_str().to_string());
        Ok(())
    }
}
