//! Saga coordinator: forward execution, reverse compensation, leasing,
//! and crash recovery.
//!
//! A submitted saga is driven by its own task: each step is invoked
//! through a [`participant::ParticipantAdapter`], every transition is
//! persisted to the saga log before and after the call, and on failure
//! the completed steps are compensated in reverse order. Leases on saga
//! rows keep at most one coordinator driving an instance; the recovery
//! scan claims expired leases and resumes where the log left off.

pub mod config;
pub mod coordinator;
pub mod error;

pub use config::Config;
pub use coordinator::{SagaCoordinator, SubmitOptions};
pub use error::{CoordinatorError, Result};
