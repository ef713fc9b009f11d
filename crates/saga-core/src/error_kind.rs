//! Error taxonomy shared by the participant adapter and the saga log.

use serde::{Deserialize, Serialize};

/// Classification of a participant failure.
///
/// The adapter buckets every failure into one of these kinds; the kind
/// decides whether the adapter retries and how the coordinator reacts
/// once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Transport-level or server-side fault expected to clear on retry.
    Transient,

    /// Domain precondition violation (insufficient stock, payment declined).
    /// Never retried; triggers compensation immediately.
    Business,

    /// Participant unreachable: circuit open, bulkhead full, or the
    /// service reported itself unavailable.
    Unavailable,

    /// Per-attempt deadline exceeded.
    Timeout,

    /// The caller cancelled the saga while the call was in flight.
    Canceled,

    /// Coordinator invariant violation. Never retried; the saga is
    /// surfaced for operator inspection without further mutation.
    FatalInternal,
}

impl ErrorKind {
    /// Returns true if the adapter may retry a failure of this kind,
    /// subject to the step definition's retryable set.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::Unavailable | ErrorKind::Timeout
        )
    }

    /// Returns the kind name as recorded in the saga log.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "TRANSIENT",
            ErrorKind::Business => "BUSINESS",
            ErrorKind::Unavailable => "UNAVAILABLE",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Canceled => "CANCELED",
            ErrorKind::FatalInternal => "FATAL_INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
