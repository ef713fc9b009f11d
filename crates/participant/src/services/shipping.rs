//! In-memory shipping service participant.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::IdempotencyKey;
use outbox::{BusinessRecord, OutboxRow, ParticipantStore};
use saga_core::ErrorKind;

use crate::client::ParticipantClient;
use crate::error::ParticipantError;
use crate::services::CallJournal;

const TARGET_CREATE: &str = "shipping.create";
const TARGET_CANCEL: &str = "shipping.cancel";

#[derive(Debug, Default)]
struct ShippingState {
    outcomes: HashMap<String, String>,
    compensated: HashSet<String>,
    scripted_failures: VecDeque<ErrorKind>,
    /// When set, every create fails with this kind until cleared.
    fail_invoke: Option<ErrorKind>,
    fail_compensation: Option<ErrorKind>,
    invoke_attempts: u32,
    compensate_attempts: u32,
    next_id: u32,
}

/// In-memory shipping participant.
///
/// `shipping.create` records a shipment row and a `ShipmentCreated`
/// event; `shipping.cancel` marks it cancelled and emits
/// `ShipmentCancelled`.
#[derive(Clone)]
pub struct ShippingParticipant<S> {
    store: S,
    journal: CallJournal,
    state: Arc<Mutex<ShippingState>>,
}

impl<S: ParticipantStore> ShippingParticipant<S> {
    /// Creates a shipping participant over the given store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            journal: CallJournal::new(),
            state: Arc::new(Mutex::new(ShippingState::default())),
        }
    }

    /// Uses a shared journal so tests can observe cross-participant order.
    pub fn with_journal(mut self, journal: CallJournal) -> Self {
        self.journal = journal;
        self
    }

    /// Makes every create fail with `kind` until cleared.
    pub fn set_fail_invoke(&self, kind: Option<ErrorKind>) {
        self.state.lock().unwrap().fail_invoke = kind;
    }

    /// Queues `count` create attempts to fail with `kind`.
    pub fn fail_invoke_times(&self, kind: ErrorKind, count: u32) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.scripted_failures.push_back(kind);
        }
    }

    /// Makes every cancel fail with `kind` until cleared.
    pub fn set_fail_compensation(&self, kind: Option<ErrorKind>) {
        self.state.lock().unwrap().fail_compensation = kind;
    }

    /// Attempts observed on `shipping.create`.
    pub fn invoke_attempts(&self) -> u32 {
        self.state.lock().unwrap().invoke_attempts
    }

    /// Attempts observed on `shipping.cancel`.
    pub fn compensate_attempts(&self) -> u32 {
        self.state.lock().unwrap().compensate_attempts
    }

    /// Number of distinct shipments created.
    pub fn shipment_count(&self) -> usize {
        self.state.lock().unwrap().outcomes.len()
    }
}

#[async_trait]
impl<S: ParticipantStore + Clone + Send + Sync + 'static> ParticipantClient
    for ShippingParticipant<S>
{
    fn name(&self) -> &str {
        "shipping"
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
                format!("shipping participant has no target '{target}'"),
            ));
        }

        self.journal.record(target);
        let handle = {
            let mut state = self.state.lock().unwrap();
            state.invoke_attempts += 1;

            if let Some(handle) = state.outcomes.get(key.as_str()) {
                return Ok(handle.clone());
            }
            if let Some(kind) = state.scripted_failures.pop_front() {
                return Err(ParticipantError::new(kind, "scripted shipping failure"));
            }
            if let Some(kind) = state.fail_invoke {
                return Err(ParticipantError::new(kind, "shipment rejected"));
            }

            state.next_id += 1;
            format!("TRK-{:04}", state.next_id)
        };

        self.store
            .commit(
                BusinessRecord::new(
                    &handle,
                    "shipment",
                    serde_json::json!({"status": "created"}),
                ),
                OutboxRow::new("Shipment", &handle, "ShipmentCreated", payload.clone()),
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
                format!("shipping participant has no compensation '{target}'"),
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
                    "shipment",
                    serde_json::json!({"status": "cancelled"}),
                ),
                OutboxRow::new(
                    "Shipment",
                    handle,
                    "ShipmentCancelled",
                    serde_json::json!({"tracking_number": handle}),
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
