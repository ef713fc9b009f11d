//! Participant adapter: the client-side wrapper the coordinator uses to
//! talk to external collaborators.
//!
//! Every call is wrapped in an explicit resilience stack: a per-attempt
//! timeout, a bulkhead bounding concurrency, a circuit breaker guarding a
//! failing participant, and retry with exponential backoff and jitter.
//! Failures are bucketed into the [`saga_core::ErrorKind`] taxonomy; only
//! exhausted retries surface to the coordinator.
//!
//! The `services` module holds in-memory order/inventory/payment
//! collaborators used by the test suites. Each one deduplicates on the
//! idempotency key and co-writes its business row and outbox event
//! through a [`outbox::ParticipantStore`].

pub mod adapter;
pub mod breaker;
pub mod bulkhead;
pub mod client;
pub mod error;
pub mod retry;
pub mod services;

pub use adapter::{AdapterFailure, AdapterOutcome, ParticipantAdapter};
pub use breaker::{BreakerConfig, CircuitBreaker};
pub use bulkhead::Bulkhead;
pub use client::ParticipantClient;
pub use error::ParticipantError;
pub use services::{
    CallJournal, InventoryParticipant, OrderParticipant, PaymentParticipant, ShippingParticipant,
};
