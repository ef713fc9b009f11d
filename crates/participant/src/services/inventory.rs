//! In-memory inventory service participant.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::IdempotencyKey;
use outbox::{BusinessRecord, OutboxRow, ParticipantStore};
use saga_core::ErrorKind;

use crate::client::ParticipantClient;
use crate::error::ParticipantError;
use crate::services::CallJournal;

const TARGET_RESERVE: &str = "inventory.reserve";
const TARGET_RELEASE: &str = "inventory.release";

#[derive(Debug, Default)]
struct InventoryState {
    outcomes: HashMap<String, String>,
    compensated: HashSet<String>,
    scripted_failures: VecDeque<ErrorKind>,
    fail_compensation: Option<ErrorKind>,
    /// Artificial latency before each reserve, for timeout tests.
    invoke_delay: Option<std::time::Duration>,
    invoke_attempts: u32,
    compensate_attempts: u32,
    next_id: u32,
    /// Reservation handles that have not been released.
    active: HashSet<String>,
}

/// In-memory inventory participant.
///
/// `inventory.reserve` records a reservation row and an
/// `InventoryReserved` event; `inventory.release` removes the
/// reservation and emits `InventoryReleased`.
#[derive(Clone)]
pub struct InventoryParticipant<S> {
    store: S,
    journal: CallJournal,
    state: Arc<Mutex<InventoryState>>,
}

impl<S: ParticipantStore> InventoryParticipant<S> {
    /// Creates an inventory participant over the given store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            journal: CallJournal::new(),
            state: Arc::new(Mutex::new(InventoryState::default())),
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

    /// Makes every release fail with `kind` until cleared.
    pub fn set_fail_compensation(&self, kind: Option<ErrorKind>) {
        self.state.lock().unwrap().fail_compensation = kind;
    }

    /// Delays every reserve by `delay` before it takes effect.
    pub fn set_invoke_delay(&self, delay: Option<std::time::Duration>) {
        self.state.lock().unwrap().invoke_delay = delay;
    }

    /// Attempts observed on `inventory.reserve`.
    pub fn invoke_attempts(&self) -> u32 {
        self.state.lock().unwrap().invoke_attempts
    }

    /// Attempts observed on `inventory.release`.
    pub fn compensate_attempts(&self) -> u32 {
        self.state.lock().unwrap().compensate_attempts
    }

    /// Reservations currently held (reserved and not released).
    pub fn active_reservations(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }
}

#[async_trait]
impl<S: ParticipantStore + Clone + Send + Sync + 'static> ParticipantClient
    for InventoryParticipant<S>
{
    fn name(&self) -> &str {
        "inventory"
    }

    async fn invoke(
        &self,
        target: &str,
        key: &IdempotencyKey,
        payload: &serde_json::Value,
    ) -> Result<String, ParticipantError> {
        if target != TARGET_RESERVE {
            return Err(ParticipantError::new(
                ErrorKind::FatalInternal,
                format!("inventory participant has no target '{target}'"),
            ));
        }

        self.journal.record(target);
        let delay = self.state.lock().unwrap().invoke_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let handle = {
            let mut state = self.state.lock().unwrap();
            state.invoke_attempts += 1;

            if let Some(handle) = state.outcomes.get(key.as_str()) {
                return Ok(handle.clone());
            }
            if let Some(kind) = state.scripted_failures.pop_front() {
                return Err(ParticipantError::new(kind, "scripted inventory failure"));
            }

            state.next_id += 1;
            format!("RES-{:04}", state.next_id)
        };

        self.store
            .commit(
                BusinessRecord::new(
                    &handle,
                    "reservation",
                    serde_json::json!({"status": "reserved", "items": payload.get("items")}),
                ),
                OutboxRow::new("Inventory", &handle, "InventoryReserved", payload.clone()),
            )
            .await
            .map_err(|e| ParticipantError::transient(e.to_string()))?;

        let mut state = self.state.lock().unwrap();
        state.outcomes.insert(key.as_str().to_string(), handle.clone());
        state.active.insert(handle.clone());
        Ok(handle)
    }

    async fn compensate(
        &self,
        target: &str,
        key: &IdempotencyKey,
        handle: &str,
    ) -> Result<(), ParticipantError> {
        if target != TARGET_RELEASE {
            return Err(ParticipantError::new(
                ErrorKind::FatalInternal,
                format!("inventory participant has no compensation '{target}'"),
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
                return Err(ParticipantError::new(kind, "scripted release failure"));
            }
        }

        self.store
            .commit(
                BusinessRecord::new(
                    handle,
                    "reservation",
                    serde_json::json!({"status": "released"}),
                ),
                OutboxRow::new(
                    "Inventory",
                    handle,
                    "InventoryReleased",
                    serde_json::json!({"reservation_id": handle}),
                ),
            )
            .await
            .map_err(|e| ParticipantError::transient(e.to_string()))?;

        let mut state = self.state.lock().unwrap();
        state.compensated.insert(key.as_str().to_string());
        state.active.remove(handle);
        Ok(())
    }
}
