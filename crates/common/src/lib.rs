//! Shared identifier types for the saga coordinator and its participants.

pub mod types;

pub use types::{EventId, IdempotencyKey, SagaId};
