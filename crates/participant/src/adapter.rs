//! The composed resilience stack around a participant client.

use std::sync::Arc;

use common::IdempotencyKey;
use saga_core::{ErrorKind, StepDefinition};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::bulkhead::Bulkhead;
use crate::client::ParticipantClient;
use crate::error::ParticipantError;
use crate::retry;

/// A successful adapter call, with the attempts it consumed.
#[derive(Debug, Clone)]
pub struct AdapterOutcome<T> {
    pub value: T,
    pub attempts: u32,
}

/// An exhausted adapter call: the classified error plus the attempts
/// consumed before giving up.
#[derive(Debug, Clone, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct AdapterFailure {
    pub error: ParticipantError,
    pub attempts: u32,
}

/// Uniform client-side wrapper over one external collaborator.
///
/// Composes, outermost to innermost: retry with backoff and jitter,
/// circuit breaker, bulkhead, per-attempt timeout. The idempotency key
/// is forwarded on every attempt so the participant can deduplicate.
pub struct ParticipantAdapter {
    client: Arc<dyn ParticipantClient>,
    breaker: CircuitBreaker,
    bulkhead: Bulkhead,
}

impl ParticipantAdapter {
    /// Wraps a client with the given breaker and bulkhead settings.
    pub fn new(
        client: Arc<dyn ParticipantClient>,
        breaker_config: BreakerConfig,
        max_concurrent: usize,
    ) -> Self {
        Self {
            client,
            breaker: CircuitBreaker::new(breaker_config),
            bulkhead: Bulkhead::new(max_concurrent),
        }
    }

    /// The wrapped participant's name.
    pub fn name(&self) -> &str {
        self.client.name()
    }

    /// Invokes a step's forward operation.
    #[tracing::instrument(skip(self, payload, cancel), fields(participant = self.name(), step = %step.name))]
    pub async fn invoke(
        &self,
        step: &StepDefinition,
        key: &IdempotencyKey,
        payload: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<AdapterOutcome<String>, AdapterFailure> {
        metrics::counter!("participant_invocations_total").increment(1);
        self.call(step, cancel, || {
            self.client.invoke(&step.invoke_target, key, payload)
        })
        .await
    }

    /// Invokes a step's compensating operation.
    ///
    /// Compensation uses the same stack; the coordinator decides what an
    /// exhausted compensation means.
    #[tracing::instrument(skip(self, cancel), fields(participant = self.name(), step = %step.name))]
    pub async fn compensate(
        &self,
        step: &StepDefinition,
        key: &IdempotencyKey,
        handle: &str,
        cancel: &CancellationToken,
    ) -> Result<AdapterOutcome<()>, AdapterFailure> {
        let target = match &step.compensate_target {
            Some(target) => target.clone(),
            None => {
                // No compensator: nothing to undo.
                return Ok(AdapterOutcome {
                    value: (),
                    attempts: 0,
                });
            }
        };
        metrics::counter!("participant_compensations_total").increment(1);
        self.call(step, cancel, || {
            self.client.compensate(&target, key, handle)
        })
        .await
    }

    async fn call<T, F, Fut>(
        &self,
        step: &StepDefinition,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<AdapterOutcome<T>, AdapterFailure>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ParticipantError>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.attempt(step, cancel, &op).await {
                Ok(value) => return Ok(AdapterOutcome { value, attempts }),
                Err(error) => {
                    let exhausted = attempts >= step.retry.max_attempts;
                    if exhausted || !step.is_retryable(error.kind) {
                        return Err(AdapterFailure { error, attempts });
                    }

                    let delay = retry::delay_with_jitter(&step.retry, attempts - 1);
                    tracing::warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "participant call failed, retrying"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return Err(AdapterFailure {
                                error: ParticipantError::canceled("cancelled during backoff"),
                                attempts,
                            });
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        step: &StepDefinition,
        cancel: &CancellationToken,
        op: &F,
    ) -> Result<T, ParticipantError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ParticipantError>>,
    {
        if cancel.is_cancelled() {
            return Err(ParticipantError::canceled("cancelled before dispatch"));
        }

        // Bulkhead before breaker, so a rejected call never consumes the
        // half-open probe.
        let Some(_permit) = self.bulkhead.try_acquire() else {
            metrics::counter!("participant_bulkhead_rejections_total").increment(1);
            return Err(ParticipantError::unavailable("bulkhead full"));
        };

        if !self.breaker.try_acquire() {
            metrics::counter!("participant_breaker_rejections_total").increment(1);
            return Err(ParticipantError::unavailable("circuit open"));
        }

        tokio::select! {
            () = cancel.cancelled() => {
                self.breaker.abandon_probe();
                Err(ParticipantError::canceled("cancelled in flight"))
            }
            result = tokio::time::timeout(step.timeout(), op()) => match result {
                Ok(Ok(value)) => {
                    self.breaker.record_success();
                    Ok(value)
                }
                Ok(Err(error)) => {
                    // Business rejections are healthy responses; they must
                    // not open the circuit.
                    match error.kind {
                        ErrorKind::Business => self.breaker.record_success(),
                        ErrorKind::Canceled => self.breaker.abandon_probe(),
                        _ => self.breaker.record_failure(),
                    }
                    Err(error)
                }
                Err(_elapsed) => {
                    self.breaker.record_failure();
                    Err(ParticipantError::timeout(format!(
                        "no response within {}ms",
                        step.timeout_ms
                    )))
                }
            }
        }
    }
}
