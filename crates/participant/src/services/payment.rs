//! In-memory payment service participant.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::IdempotencyKey;
use outbox::{BusinessRecord, OutboxRow, ParticipantStore};
use saga_core::ErrorKind;

use crate::client::ParticipantClient;
use crate::error::ParticipantError;
use crate::services::CallJournal;

const TARGET_CHARGE: &str = "payment.charge";
const TARGET_REFUND: &str = "payment.refund";

#[derive(Debug, Default)]
struct PaymentState {
    outcomes: HashMap<String, String>,
    compensated: HashSet<String>,
    scripted_failures: VecDeque<ErrorKind>,
    /// When set, every charge is declined until cleared.
    decline_charges: bool,
    fail_compensation: Option<ErrorKind>,
    invoke_attempts: u32,
    compensate_attempts: u32,
    next_id: u32,
}

/// In-memory payment participant.
///
/// `payment.charge` records a payment row and a `PaymentProcessed`
/// event; `payment.refund` marks it refunded and emits
/// `PaymentRefunded`. A declined charge is a `BUSINESS` failure and is
/// never retried by the adapter.
#[derive(Clone)]
pub struct PaymentParticipant<S> {
    store: S,
    journal: CallJournal,
    state: Arc<Mutex<PaymentState>>,
}

impl<S: ParticipantStore> PaymentParticipant<S> {
    /// Creates a payment participant over the given store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            journal: CallJournal::new(),
            state: Arc::new(Mutex::new(PaymentState::default())),
        }
    }

    /// Uses a shared journal so tests can observe cross-participant order.
    pub fn with_journal(mut self, journal: CallJournal) -> Self {
        self.journal = journal;
        self
    }

    /// Declines every charge until cleared.
    pub fn set_decline_charges(&self, decline: bool) {
        self.state.lock().unwrap().decline_charges = decline;
    }

    /// Queues `count` charge attempts to fail with `kind`.
    pub fn fail_invoke_times(&self, kind: ErrorKind, count: u32) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.scripted_failures.push_back(kind);
        }
    }

    /// Makes every refund fail with `kind` until cleared.
    pub fn set_fail_compensation(&self, kind: Option<ErrorKind>) {
        self.state.lock().unwrap().fail_compensation = kind;
    }

    /// Attempts observed on `payment.charge`.
    pub fn invoke_attempts(&self) -> u32 {
        self.state.lock().unwrap().invoke_attempts
    }

    /// Attempts observed on `payment.refund`.
    pub fn compensate_attempts(&self) -> u32 {
        self.state.lock().unwrap().compensate_attempts
    }

    /// Number of distinct successful charges.
    pub fn charged_count(&self) -> usize {
        self.state.lock().unwrap().outcomes.len()
    }
}

#[async_trait]
impl<S: ParticipantStore + Clone + Send + Sync + 'static> ParticipantClient
    for PaymentParticipant<S>
{
    fn name(&self) -> &str {
        "payment"
    }

    async fn invoke(
        &self,
        target: &str,
        key: &IdempotencyKey,
        payload: &serde_json::Value,
    ) -> Result<String, ParticipantError> {
        if target != TARGET_CHARGE {
            return Err(ParticipantError::new(
                ErrorKind::FatalInternal,
                format!("payment participant has no target '{target}'"),
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
                return Err(ParticipantError::new(kind, "scripted payment failure"));
            }
            if state.decline_charges {
                return Err(ParticipantError::business("payment declined"));
            }

            state.next_id += 1;
            format!("PAY-{:04}", state.next_id)
        };

        self.store
            .commit(
                BusinessRecord::new(
                    &handle,
                    "payment",
                    serde_json::json!({"status": "captured", "amount": payload.get("total")}),
                ),
                OutboxRow::new("Payment", &handle, "PaymentProcessed", payload.clone()),
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
        if target != TARGET_REFUND {
            return Err(ParticipantError::new(
                ErrorKind::FatalInternal,
                format!("payment participant has no compensation '{target}'"),
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
                return Err(ParticipantError::new(kind, "scripted refund failure"));
            }
        }

        self.store
            .commit(
                BusinessRecord::new(
                    handle,
                    "payment",
                    serde_json::json!({"status": "refunded"}),
                ),
                OutboxRow::new(
                    "Payment",
                    handle,
                    "PaymentRefunded",
                    serde_json::json!({"payment_id": handle}),
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
