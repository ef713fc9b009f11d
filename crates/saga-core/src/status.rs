//! Saga and step state machines.

use serde::{Deserialize, Serialize};

/// The status of a saga in its lifecycle.
///
/// Status transitions form a DAG:
/// ```text
/// STARTED ──► RUNNING ──┬──► COMPLETED
///                       └──► COMPENSATING ──┬──► COMPENSATED
///                                           └──► COMPENSATION_FAILED
/// STARTED ──► ABORTED          (only before any step runs)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Saga is durably logged but no step has run yet.
    #[default]
    Started,

    /// Steps are being executed in definition order.
    Running,

    /// Every step completed successfully (terminal).
    Completed,

    /// A step failed and compensations are being driven in reverse.
    Compensating,

    /// Every eligible step was compensated (terminal).
    Compensated,

    /// At least one compensation exhausted its retries; operator
    /// intervention is required (terminal).
    CompensationFailed,

    /// Saga was aborted before its first step ran (terminal).
    Aborted,
}

impl SagaStatus {
    /// Returns true if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed
                | SagaStatus::Compensated
                | SagaStatus::CompensationFailed
                | SagaStatus::Aborted
        )
    }

    /// Returns true if the saga may still execute forward steps.
    pub fn can_run(&self) -> bool {
        matches!(self, SagaStatus::Started | SagaStatus::Running)
    }

    /// Returns true if the saga may enter compensation.
    pub fn can_compensate(&self) -> bool {
        matches!(self, SagaStatus::Started | SagaStatus::Running)
    }

    /// Returns the status name as stored in the saga log.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Started => "STARTED",
            SagaStatus::Running => "RUNNING",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Compensated => "COMPENSATED",
            SagaStatus::CompensationFailed => "COMPENSATION_FAILED",
            SagaStatus::Aborted => "ABORTED",
        }
    }

    /// Parses a status from its saga log representation.
    pub fn from_str_value(s: &str) -> Result<Self, InvalidStatus> {
        match s {
            "STARTED" => Ok(SagaStatus::Started),
            "RUNNING" => Ok(SagaStatus::Running),
            "COMPLETED" => Ok(SagaStatus::Completed),
            "COMPENSATING" => Ok(SagaStatus::Compensating),
            "COMPENSATED" => Ok(SagaStatus::Compensated),
            "COMPENSATION_FAILED" => Ok(SagaStatus::CompensationFailed),
            "ABORTED" => Ok(SagaStatus::Aborted),
            _ => Err(InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid status: {0}")]
pub struct InvalidStatus(pub String);

/// The status of a single step within a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Step has not produced an outcome yet.
    #[default]
    Pending,

    /// Step invocation succeeded and its handle is recorded.
    Ok,

    /// Step invocation failed after the adapter exhausted its retries.
    Failed,

    /// Compensation for this step is in flight.
    Compensating,

    /// Compensation for this step succeeded (or the step has no compensator).
    Compensated,

    /// Compensation for this step failed; operator action required.
    CompensationFailed,
}

impl StepStatus {
    /// Returns true if compensation for this step reached a terminal outcome.
    pub fn compensation_settled(&self) -> bool {
        matches!(self, StepStatus::Compensated | StepStatus::CompensationFailed)
    }

    /// Returns the status name as stored in the saga log.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Ok => "OK",
            StepStatus::Failed => "FAILED",
            StepStatus::Compensating => "COMPENSATING",
            StepStatus::Compensated => "COMPENSATED",
            StepStatus::CompensationFailed => "COMPENSATION_FAILED",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_started() {
        assert_eq!(SagaStatus::default(), SagaStatus::Started);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!SagaStatus::Started.is_terminal());
        assert!(!SagaStatus::Running.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(SagaStatus::Completed.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(SagaStatus::CompensationFailed.is_terminal());
        assert!(SagaStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_can_run() {
        assert!(SagaStatus::Started.can_run());
        assert!(SagaStatus::Running.can_run());
        assert!(!SagaStatus::Compensating.can_run());
        assert!(!SagaStatus::Completed.can_run());
    }

    #[test]
    fn test_can_compensate() {
        assert!(SagaStatus::Started.can_compensate());
        assert!(SagaStatus::Running.can_compensate());
        assert!(!SagaStatus::Compensating.can_compensate());
        assert!(!SagaStatus::Compensated.can_compensate());
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            SagaStatus::Started,
            SagaStatus::Running,
            SagaStatus::Completed,
            SagaStatus::Compensating,
            SagaStatus::Compensated,
            SagaStatus::CompensationFailed,
            SagaStatus::Aborted,
        ] {
            assert_eq!(SagaStatus::from_str_value(status.as_str()).unwrap(), status);
        }
        assert!(SagaStatus::from_str_value("UNKNOWN").is_err());
    }

    #[test]
    fn test_status_serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&SagaStatus::CompensationFailed).unwrap();
        assert_eq!(json, "\"COMPENSATION_FAILED\"");
    }

    #[test]
    fn test_compensation_settled() {
        assert!(!StepStatus::Pending.compensation_settled());
        assert!(!StepStatus::Ok.compensation_settled());
        assert!(!StepStatus::Compensating.compensation_settled());
        assert!(StepStatus::Compensated.compensation_settled());
        assert!(StepStatus::CompensationFailed.compensation_settled());
    }

    #[test]
    fn test_step_status_display() {
        assert_eq!(StepStatus::Ok.to_string(), "OK");
        assert_eq!(StepStatus::CompensationFailed.to_string(), "COMPENSATION_FAILED");
    }
}
