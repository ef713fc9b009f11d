//! The persistent saga instance row.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};

use crate::definition::SagaDefinition;
use crate::error_kind::ErrorKind;
use crate::status::{SagaStatus, StepStatus};

/// Outcome of one step within a saga, aligned by index with the definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step name copied from the definition at submit time.
    pub name: String,
    /// Current step status.
    pub status: StepStatus,
    /// Opaque identifier returned by the participant (order id,
    /// reservation id, payment id). Required by the compensator.
    pub handle: Option<String>,
    /// Classification of the last failure, if any.
    pub error_kind: Option<ErrorKind>,
    /// Human-readable failure detail for operators.
    pub error_message: Option<String>,
    /// Invocation attempts consumed by the adapter.
    pub attempt_count: u32,
    /// When the step was first handed to the adapter.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal forward or compensation outcome.
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Pending,
            handle: None,
            error_kind: None,
            error_message: None,
            attempt_count: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Error returned when a mutation would violate the saga state machine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot {action} while saga is {status}")]
    InvalidStatus {
        action: &'static str,
        status: SagaStatus,
    },

    #[error("step {index} is not eligible for {action}")]
    InvalidStep { action: &'static str, index: usize },
}

/// A saga instance as persisted in the saga log.
///
/// Every mutation goes through a transition method that enforces the
/// status DAG and bumps `updated_at`; the coordinator persists the row
/// after each transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    pub saga_id: SagaId,
    pub definition_id: String,
    pub status: SagaStatus,
    /// Index of the next step to execute; monotonically non-decreasing
    /// until compensation begins.
    pub current_step_index: usize,
    pub step_results: Vec<StepResult>,
    /// The original request, immutable for the life of the saga.
    pub input_payload: serde_json::Value,
    /// Client-supplied submit idempotency key, unique across sagas.
    pub client_request_id: Option<String>,
    /// Coordinator instance currently driving this saga.
    pub owner_id: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optional wall-clock deadline for the whole saga.
    pub deadline_at: Option<DateTime<Utc>>,
    /// Operator-facing reason for compensation or failure.
    pub failure_reason: Option<String>,
}

impl SagaInstance {
    /// Creates a new `STARTED` instance for the given definition.
    pub fn new(
        definition: &SagaDefinition,
        input_payload: serde_json::Value,
        client_request_id: Option<String>,
        deadline_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            saga_id: SagaId::new(),
            definition_id: definition.id.clone(),
            status: SagaStatus::Started,
            current_step_index: 0,
            step_results: definition
                .steps
                .iter()
                .map(|s| StepResult::pending(&s.name))
                .collect(),
            input_payload,
            client_request_id,
            owner_id: None,
            lease_expiry: None,
            created_at: now,
            updated_at: now,
            deadline_at,
            failure_reason: None,
        }
    }

    /// Returns true if the saga reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if any step has been handed to a participant.
    pub fn has_begun(&self) -> bool {
        self.step_results.iter().any(|s| s.started_at.is_some())
    }

    /// Transitions `STARTED -> RUNNING`.
    pub fn start_running(&mut self) -> Result<(), TransitionError> {
        if self.status != SagaStatus::Started {
            return Err(TransitionError::InvalidStatus {
                action: "start running",
                status: self.status,
            });
        }
        self.status = SagaStatus::Running;
        self.touch();
        Ok(())
    }

    /// Marks step `index` as handed to the adapter.
    ///
    /// Persisted before the invocation so that recovery knows the step
    /// may already have taken effect on the participant side.
    pub fn begin_step(&mut self, index: usize) -> Result<(), TransitionError> {
        if self.status != SagaStatus::Running {
            return Err(TransitionError::InvalidStatus {
                action: "begin step",
                status: self.status,
            });
        }
        if index != self.current_step_index || index >= self.step_results.len() {
            return Err(TransitionError::InvalidStep {
                action: "begin",
                index,
            });
        }
        let step = &mut self.step_results[index];
        step.status = StepStatus::Pending;
        if step.started_at.is_none() {
            step.started_at = Some(Utc::now());
        }
        self.touch();
        Ok(())
    }

    /// Records a successful invocation and advances the step cursor.
    ///
    /// The handle lands in the same row write that advances
    /// `current_step_index`, so a handle is never lost.
    pub fn record_step_ok(
        &mut self,
        index: usize,
        handle: impl Into<String>,
        attempts: u32,
    ) -> Result<(), TransitionError> {
        if index != self.current_step_index || index >= self.step_results.len() {
            return Err(TransitionError::InvalidStep { action: "complete", index });
        }
        let step = &mut self.step_results[index];
        step.status = StepStatus::Ok;
        step.handle = Some(handle.into());
        step.attempt_count = attempts;
        step.finished_at = Some(Utc::now());
        self.current_step_index += 1;
        self.touch();
        Ok(())
    }

    /// Records a step failure after the adapter exhausted its retries.
    pub fn record_step_failed(
        &mut self,
        index: usize,
        kind: ErrorKind,
        message: impl Into<String>,
        attempts: u32,
    ) -> Result<(), TransitionError> {
        if index >= self.step_results.len() {
            return Err(TransitionError::InvalidStep { action: "fail", index });
        }
        let step = &mut self.step_results[index];
        step.status = StepStatus::Failed;
        step.error_kind = Some(kind);
        step.error_message = Some(message.into());
        step.attempt_count = attempts;
        step.finished_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Transitions the saga into `COMPENSATING`.
    pub fn begin_compensation(
        &mut self,
        reason: impl Into<String>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_compensate() {
            return Err(TransitionError::InvalidStatus {
                action: "begin compensation",
                status: self.status,
            });
        }
        self.status = SagaStatus::Compensating;
        self.failure_reason = Some(reason.into());
        self.touch();
        Ok(())
    }

    /// Marks a previously-`OK` step as compensating.
    pub fn begin_step_compensation(&mut self, index: usize) -> Result<(), TransitionError> {
        if self.status != SagaStatus::Compensating {
            return Err(TransitionError::InvalidStatus {
                action: "compensate step",
                status: self.status,
            });
        }
        let eligible = self
            .step_results
            .get(index)
            .is_some_and(|s| s.status == StepStatus::Ok || s.status == StepStatus::Compensating);
        if !eligible {
            return Err(TransitionError::InvalidStep {
                action: "compensate",
                index,
            });
        }
        self.step_results[index].status = StepStatus::Compensating;
        self.touch();
        Ok(())
    }

    /// Records a successful (or trivially absent) compensation for a step.
    pub fn record_step_compensated(&mut self, index: usize) -> Result<(), TransitionError> {
        if index >= self.step_results.len() {
            return Err(TransitionError::InvalidStep {
                action: "compensate",
                index,
            });
        }
        let step = &mut self.step_results[index];
        step.status = StepStatus::Compensated;
        step.finished_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Records a compensation failure; the saga keeps compensating the
    /// remaining steps best-effort.
    pub fn record_step_compensation_failed(
        &mut self,
        index: usize,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Result<(), TransitionError> {
        if index >= self.step_results.len() {
            return Err(TransitionError::InvalidStep {
                action: "compensate",
                index,
            });
        }
        let step = &mut self.step_results[index];
        step.status = StepStatus::CompensationFailed;
        step.error_kind = Some(kind);
        step.error_message = Some(message.into());
        step.finished_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Settles the saga after compensation: `COMPENSATED` only if every
    /// eligible step compensated, `COMPENSATION_FAILED` otherwise.
    pub fn finish_compensation(&mut self) -> Result<SagaStatus, TransitionError> {
        if self.status != SagaStatus::Compensating {
            return Err(TransitionError::InvalidStatus {
                action: "finish compensation",
                status: self.status,
            });
        }
        let any_failed = self
            .step_results
            .iter()
            .any(|s| s.status == StepStatus::CompensationFailed);
        self.status = if any_failed {
            SagaStatus::CompensationFailed
        } else {
            SagaStatus::Compensated
        };
        self.touch();
        Ok(self.status)
    }

    /// Transitions `RUNNING -> COMPLETED`. Every step must be `OK`.
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        if self.status != SagaStatus::Running {
            return Err(TransitionError::InvalidStatus {
                action: "complete",
                status: self.status,
            });
        }
        if self.step_results.iter().any(|s| s.status != StepStatus::Ok) {
            return Err(TransitionError::InvalidStep {
                action: "complete",
                index: self.current_step_index,
            });
        }
        self.status = SagaStatus::Completed;
        self.touch();
        Ok(())
    }

    /// Transitions `STARTED -> ABORTED`; valid only before any step runs.
    pub fn abort(&mut self) -> Result<(), TransitionError> {
        if self.status != SagaStatus::Started || self.has_begun() {
            return Err(TransitionError::InvalidStatus {
                action: "abort",
                status: self.status,
            });
        }
        self.status = SagaStatus::Aborted;
        self.touch();
        Ok(())
    }

    /// Refreshes the lease for the given owner.
    pub fn touch_lease(&mut self, owner: &str, ttl: std::time::Duration) {
        self.owner_id = Some(owner.to_string());
        self.lease_expiry = Some(
            Utc::now() + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::seconds(30)),
        );
        self.touch();
    }

    /// Releases the lease (graceful shutdown or terminal status).
    pub fn clear_lease(&mut self) {
        self.owner_id = None;
        self.lease_expiry = None;
        self.touch();
    }

    /// Returns true if the lease is absent or expired at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match self.lease_expiry {
            Some(expiry) => expiry <= now,
            None => true,
        }
    }

    /// Returns true if the saga deadline has passed at `now`.
    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.deadline_at.is_some_and(|d| d <= now)
    }

    /// Indices of steps eligible for compensation, in reverse order:
    /// every `OK` or in-flight-compensating step below the cursor whose
    /// compensation has not settled.
    pub fn compensation_indices(&self) -> Vec<usize> {
        (0..self.current_step_index.min(self.step_results.len()))
            .rev()
            .filter(|&i| {
                matches!(
                    self.step_results[i].status,
                    StepStatus::Ok | StepStatus::Compensating
                )
            })
            .collect()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StepDefinition;

    fn definition() -> SagaDefinition {
        SagaDefinition::new(
            "order-fulfillment",
            vec![
                StepDefinition::new("create_order", "order", "order.create")
                    .with_compensation("order.cancel"),
                StepDefinition::new("reserve_inventory", "inventory", "inventory.reserve")
                    .with_compensation("inventory.release"),
                StepDefinition::new("process_payment", "payment", "payment.charge")
                    .with_compensation("payment.refund"),
            ],
        )
        .unwrap()
    }

    fn new_saga() -> SagaInstance {
        SagaInstance::new(&definition(), serde_json::json!({"customer": "c1"}), None, None)
    }

    #[test]
    fn test_new_instance_shape() {
        let saga = new_saga();
        assert_eq!(saga.status, SagaStatus::Started);
        assert_eq!(saga.current_step_index, 0);
        assert_eq!(saga.step_results.len(), 3);
        assert!(saga.step_results.iter().all(|s| s.status == StepStatus::Pending));
        assert!(!saga.has_begun());
        assert!(!saga.is_terminal());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut saga = new_saga();
        saga.start_running().unwrap();

        for i in 0..3 {
            saga.begin_step(i).unwrap();
            assert!(saga.has_begun());
            saga.record_step_ok(i, format!("H-{i}"), 1).unwrap();
            assert_eq!(saga.current_step_index, i + 1);
        }

        saga.complete().unwrap();
        assert_eq!(saga.status, SagaStatus::Completed);
        assert!(saga.is_terminal());
    }

    #[test]
    fn test_handle_recorded_with_advance() {
        let mut saga = new_saga();
        saga.start_running().unwrap();
        saga.begin_step(0).unwrap();
        saga.record_step_ok(0, "ORD-0001", 2).unwrap();

        let step = &saga.step_results[0];
        assert_eq!(step.handle.as_deref(), Some("ORD-0001"));
        assert_eq!(step.attempt_count, 2);
        assert_eq!(saga.current_step_index, 1);
    }

    #[test]
    fn test_cannot_complete_with_pending_steps() {
        let mut saga = new_saga();
        saga.start_running().unwrap();
        saga.begin_step(0).unwrap();
        saga.record_step_ok(0, "H", 1).unwrap();
        assert!(saga.complete().is_err());
    }

    #[test]
    fn test_begin_step_requires_cursor_match() {
        let mut saga = new_saga();
        saga.start_running().unwrap();
        assert!(saga.begin_step(1).is_err());
        saga.begin_step(0).unwrap();
    }

    #[test]
    fn test_compensation_flow() {
        let mut saga = new_saga();
        saga.start_running().unwrap();
        saga.begin_step(0).unwrap();
        saga.record_step_ok(0, "ORD-1", 1).unwrap();
        saga.begin_step(1).unwrap();
        saga.record_step_ok(1, "RES-1", 1).unwrap();
        saga.begin_step(2).unwrap();
        saga.record_step_failed(2, ErrorKind::Business, "declined", 1)
            .unwrap();

        saga.begin_compensation("payment declined").unwrap();
        assert_eq!(saga.compensation_indices(), vec![1, 0]);

        saga.begin_step_compensation(1).unwrap();
        saga.record_step_compensated(1).unwrap();
        saga.begin_step_compensation(0).unwrap();
        saga.record_step_compensated(0).unwrap();

        assert_eq!(saga.finish_compensation().unwrap(), SagaStatus::Compensated);
        assert!(saga.is_terminal());
        assert_eq!(saga.failure_reason.as_deref(), Some("payment declined"));
    }

    #[test]
    fn test_compensation_failure_marks_saga() {
        let mut saga = new_saga();
        saga.start_running().unwrap();
        saga.begin_step(0).unwrap();
        saga.record_step_ok(0, "ORD-1", 1).unwrap();
        saga.begin_step(1).unwrap();
        saga.record_step_failed(1, ErrorKind::Timeout, "deadline", 4)
            .unwrap();

        saga.begin_compensation("reserve_inventory timed out").unwrap();
        saga.begin_step_compensation(0).unwrap();
        saga.record_step_compensation_failed(0, ErrorKind::Unavailable, "service down")
            .unwrap();

        assert_eq!(
            saga.finish_compensation().unwrap(),
            SagaStatus::CompensationFailed
        );
    }

    #[test]
    fn test_abort_only_before_first_step() {
        let mut saga = new_saga();
        saga.abort().unwrap();
        assert_eq!(saga.status, SagaStatus::Aborted);

        let mut saga = new_saga();
        saga.start_running().unwrap();
        saga.begin_step(0).unwrap();
        assert!(saga.abort().is_err());
    }

    #[test]
    fn test_compensation_skips_non_ok_steps() {
        let mut saga = new_saga();
        saga.start_running().unwrap();
        saga.begin_step(0).unwrap();
        saga.record_step_ok(0, "ORD-1", 1).unwrap();
        saga.begin_step(1).unwrap();
        saga.record_step_failed(1, ErrorKind::Business, "no stock", 1)
            .unwrap();
        saga.begin_compensation("no stock").unwrap();

        // Only step 0 completed; the failed step is not compensated.
        assert_eq!(saga.compensation_indices(), vec![0]);
    }

    #[test]
    fn test_lease_bookkeeping() {
        let mut saga = new_saga();
        assert!(saga.lease_expired(Utc::now()));

        saga.touch_lease("coord-1", std::time::Duration::from_secs(30));
        assert_eq!(saga.owner_id.as_deref(), Some("coord-1"));
        assert!(!saga.lease_expired(Utc::now()));
        assert!(saga.lease_expired(Utc::now() + ChronoDuration::seconds(31)));

        saga.clear_lease();
        assert!(saga.owner_id.is_none());
        assert!(saga.lease_expired(Utc::now()));
    }

    #[test]
    fn test_deadline_check() {
        let mut saga = new_saga();
        assert!(!saga.deadline_passed(Utc::now()));
        saga.deadline_at = Some(Utc::now() - ChronoDuration::seconds(1));
        assert!(saga.deadline_passed(Utc::now()));
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut saga = new_saga();
        saga.start_running().unwrap();
        saga.begin_step(0).unwrap();
        saga.record_step_ok(0, "ORD-1", 1).unwrap();

        let json = serde_json::to_string(&saga).unwrap();
        let back: SagaInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(back.saga_id, saga.saga_id);
        assert_eq!(back.status, SagaStatus::Running);
        assert_eq!(back.step_results[0].handle.as_deref(), Some("ORD-1"));
        assert_eq!(back.current_step_index, 1);
    }
}
