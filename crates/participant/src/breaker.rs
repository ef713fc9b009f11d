//! Per-participant circuit breaker.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failure rate over the sliding window that opens the circuit.
    pub failure_rate: f64,
    /// Minimum recorded outcomes before the rate is evaluated.
    pub min_samples: usize,
    /// How long the circuit stays open before admitting a probe.
    pub open_duration: Duration,
    /// Sliding window size in outcomes.
    pub window: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.5,
            min_samples: 10,
            open_duration: Duration::from_secs(30),
            window: 32,
        }
    }
}

#[derive(Debug)]
enum BreakerState {
    /// Calls flow; outcomes feed the sliding window.
    Closed { outcomes: VecDeque<bool> },
    /// Calls fail fast until the open duration elapses.
    Open { until: Instant },
    /// One probe is admitted; its outcome decides the next state.
    HalfOpen { probing: bool },
}

/// Failure-rate circuit breaker with a half-open probe.
///
/// When the recent failure rate crosses the threshold, the circuit opens
/// and calls fail fast with `UNAVAILABLE` without touching the wire.
/// After `open_duration` a single probe is admitted; success closes the
/// circuit, failure re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::Closed {
                outcomes: VecDeque::new(),
            }),
        }
    }

    /// Asks the breaker to admit a call. Returns false when the circuit
    /// is open (or a half-open probe is already in flight).
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { until } => {
                if Instant::now() >= *until {
                    *state = BreakerState::HalfOpen { probing: true };
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen { probing } => {
                if *probing {
                    false
                } else {
                    *probing = true;
                    true
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            BreakerState::Closed { outcomes } => {
                Self::push(outcomes, true, self.config.window);
            }
            BreakerState::HalfOpen { .. } => {
                *state = BreakerState::Closed {
                    outcomes: VecDeque::new(),
                };
            }
            BreakerState::Open { .. } => {}
        }
    }

    /// Records a failed call, opening the circuit when the window's
    /// failure rate crosses the threshold.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            BreakerState::Closed { outcomes } => {
                Self::push(outcomes, false, self.config.window);
                if outcomes.len() >= self.config.min_samples {
                    let failures = outcomes.iter().filter(|ok| !**ok).count();
                    let rate = failures as f64 / outcomes.len() as f64;
                    if rate >= self.config.failure_rate {
                        *state = BreakerState::Open {
                            until: Instant::now() + self.config.open_duration,
                        };
                    }
                }
            }
            BreakerState::HalfOpen { .. } => {
                *state = BreakerState::Open {
                    until: Instant::now() + self.config.open_duration,
                };
            }
            BreakerState::Open { .. } => {}
        }
    }

    /// Withdraws an admitted half-open probe that never reached the wire
    /// (e.g. the caller was cancelled first), so the next call may probe.
    pub fn abandon_probe(&self) {
        let mut state = self.state.lock().unwrap();
        if let BreakerState::HalfOpen { probing } = &mut *state {
            *probing = false;
        }
    }

    /// Returns the current state name, for logs and tests.
    pub fn state_name(&self) -> &'static str {
        match &*self.state.lock().unwrap() {
            BreakerState::Closed { .. } => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen { .. } => "half_open",
        }
    }

    fn push(outcomes: &mut VecDeque<bool>, ok: bool, window: usize) {
        if outcomes.len() == window {
            outcomes.pop_front();
        }
        outcomes.push_back(ok);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(min_samples: usize, open_duration: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_rate: 0.5,
            min_samples,
            open_duration,
            window: 8,
        })
    }

    #[test]
    fn test_closed_admits_calls() {
        let b = breaker(4, Duration::from_secs(30));
        assert!(b.try_acquire());
        assert_eq!(b.state_name(), "closed");
    }

    #[test]
    fn test_opens_at_failure_rate() {
        let b = breaker(4, Duration::from_secs(30));
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state_name(), "closed");
        // Fourth sample pushes the rate to 3/4.
        b.record_failure();
        assert_eq!(b.state_name(), "open");
        assert!(!b.try_acquire());
    }

    #[test]
    fn test_below_min_samples_never_opens() {
        let b = breaker(10, Duration::from_secs(30));
        for _ in 0..5 {
            b.record_failure();
        }
        assert_eq!(b.state_name(), "closed");
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let b = breaker(2, Duration::from_millis(0));
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state_name(), "open");

        // Open duration elapsed: first caller becomes the probe.
        assert!(b.try_acquire());
        assert_eq!(b.state_name(), "half_open");
        assert!(!b.try_acquire());

        b.record_success();
        assert_eq!(b.state_name(), "closed");
        assert!(b.try_acquire());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let b = breaker(2, Duration::from_millis(0));
        b.record_failure();
        b.record_failure();
        assert!(b.try_acquire());
        b.record_failure();
        assert_eq!(b.state_name(), "open");
    }

    #[test]
    fn test_abandoned_probe_can_be_retaken() {
        let b = breaker(2, Duration::from_millis(0));
        b.record_failure();
        b.record_failure();
        assert!(b.try_acquire());
        assert!(!b.try_acquire());

        b.abandon_probe();
        assert!(b.try_acquire());
    }

    #[test]
    fn test_window_slides() {
        let b = breaker(4, Duration::from_secs(30));
        // Fill the window with successes, then fail less than the rate.
        for _ in 0..8 {
            b.record_success();
        }
        b.record_failure();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state_name(), "closed");
        b.record_failure();
        assert_eq!(b.state_name(), "open");
    }
}
