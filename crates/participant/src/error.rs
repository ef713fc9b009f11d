use saga_core::ErrorKind;
use thiserror::Error;

/// A classified participant failure.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ParticipantError {
    /// Which bucket of the taxonomy this failure falls into.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl ParticipantError {
    /// Creates an error with an explicit kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Transport or server fault expected to clear on retry.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// Domain precondition violation; never retried.
    pub fn business(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Business, message)
    }

    /// Breaker open, bulkhead full, or service self-reported unavailable.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    /// Per-attempt deadline exceeded.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Caller cancellation observed.
    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_set_kind() {
        assert_eq!(ParticipantError::transient("x").kind, ErrorKind::Transient);
        assert_eq!(ParticipantError::business("x").kind, ErrorKind::Business);
        assert_eq!(ParticipantError::unavailable("x").kind, ErrorKind::Unavailable);
        assert_eq!(ParticipantError::timeout("x").kind, ErrorKind::Timeout);
        assert_eq!(ParticipantError::canceled("x").kind, ErrorKind::Canceled);
    }

    #[test]
    fn test_display_includes_kind_and_message() {
        let err = ParticipantError::business("payment declined");
        assert_eq!(err.to_string(), "BUSINESS: payment declined");
    }
}
