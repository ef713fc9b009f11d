//! In-memory collaborators for the order fulfillment saga.
//!
//! Each service honours the participant contract: calls are idempotent
//! on the key, and every business mutation is co-written with its outbox
//! event through a [`outbox::ParticipantStore`]. Failure switches let
//! tests script transient, business, and compensation faults.

pub mod inventory;
pub mod order;
pub mod payment;
pub mod shipping;

use std::sync::{Arc, Mutex};

pub use inventory::InventoryParticipant;
pub use order::OrderParticipant;
pub use payment::PaymentParticipant;
pub use shipping::ShippingParticipant;

/// Shared journal of participant operations, in call order.
///
/// Tests hand the same journal to several participants to observe
/// cross-participant ordering (e.g. compensation running in reverse).
#[derive(Debug, Clone, Default)]
pub struct CallJournal {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallJournal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one operation.
    pub fn record(&self, operation: impl Into<String>) {
        self.calls.lock().unwrap().push(operation.into());
    }

    /// Returns all recorded operations in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}
