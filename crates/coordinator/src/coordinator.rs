//! The saga coordinator and its per-saga driver tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use common::{EventId, IdempotencyKey, SagaId};
use event_bus::{BusMessage, EventBus};
use participant::{ParticipantAdapter, ParticipantClient};
use saga_core::{
    DefinitionRegistry, ErrorKind, SagaDefinition, SagaInstance, SagaStatus, TransitionError,
};
use saga_log::{SagaLogError, SagaLogStore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{CoordinatorError, Result};

/// Options accepted by [`SagaCoordinator::submit`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Client-side submit deduplication key: a re-submission with the
    /// same key returns the existing saga ID.
    pub idempotency_key: Option<String>,
    /// Wall-clock deadline for the whole saga.
    pub deadline: Option<DateTime<Utc>>,
}

/// Outcome of the forward execution loop.
enum Forward {
    /// A terminal status was written and settled.
    Terminal,
    /// Shutdown or an internal fault paused the saga; the lease must be
    /// released so another coordinator can resume it.
    Paused,
    /// A step failed and the saga is now `COMPENSATING`.
    EnterCompensation,
}

struct Inner<L> {
    log: L,
    registry: DefinitionRegistry,
    participants: HashMap<String, ParticipantAdapter>,
    lifecycle_bus: Option<Arc<dyn EventBus>>,
    config: Config,
    owner_id: String,
    accepting: AtomicBool,
    shutdown: CancellationToken,
    drivers: tokio::sync::Mutex<JoinSet<()>>,
    abort_tokens: Mutex<HashMap<SagaId, CancellationToken>>,
}

/// Orchestrates saga execution against a saga log and a set of
/// participant clients.
///
/// Cloning is cheap: clones share the same coordinator instance (and its
/// `owner_id`), so drivers, the recovery loop, and callers all see one
/// leaseholder.
pub struct SagaCoordinator<L> {
    inner: Arc<Inner<L>>,
}

impl<L> Clone for SagaCoordinator<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L> SagaCoordinator<L>
where
    L: SagaLogStore + Send + Sync + 'static,
{
    /// Creates a coordinator over a saga log, a definition registry, and
    /// participant clients. `lifecycle_bus`, when present, receives a
    /// notification for every terminal saga status.
    pub fn new(
        log: L,
        registry: DefinitionRegistry,
        participants: Vec<Arc<dyn ParticipantClient>>,
        lifecycle_bus: Option<Arc<dyn EventBus>>,
        config: Config,
    ) -> Self {
        let participants = participants
            .into_iter()
            .map(|client| {
                let adapter = ParticipantAdapter::new(
                    client,
                    config.breaker.clone(),
                    config.bulkhead_max_concurrent,
                );
                (adapter.name().to_string(), adapter)
            })
            .collect();

        Self {
            inner: Arc::new(Inner {
                log,
                registry,
                participants,
                lifecycle_bus,
                config,
                owner_id: format!("coordinator-{}", Uuid::new_v4()),
                accepting: AtomicBool::new(true),
                shutdown: CancellationToken::new(),
                drivers: tokio::sync::Mutex::new(JoinSet::new()),
                abort_tokens: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// This coordinator's lease owner identifier.
    pub fn owner_id(&self) -> &str {
        &self.inner.owner_id
    }

    /// Submits a saga for execution.
    ///
    /// Returns once the `STARTED` record is durable; from that point the
    /// saga makes progress without further caller action, surviving a
    /// coordinator crash through the recovery scan.
    #[tracing::instrument(skip(self, input, options))]
    pub async fn submit(
        &self,
        definition_id: &str,
        input: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<SagaId> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(CoordinatorError::ShuttingDown);
        }
        metrics::counter!("saga_submissions_total").increment(1);

        if let Some(key) = &options.idempotency_key
            && let Some(existing) = self.inner.log.find_by_client_request(key).await?
        {
            tracing::info!(saga_id = %existing.saga_id, "duplicate submit, returning existing saga");
            return Ok(existing.saga_id);
        }

        let definition = self
            .inner
            .registry
            .get(definition_id)
            .ok_or_else(|| CoordinatorError::DefinitionNotFound(definition_id.to_string()))?;
        for step in &definition.steps {
            if !self.inner.participants.contains_key(&step.service) {
                return Err(CoordinatorError::UnknownParticipant {
                    service: step.service.clone(),
                    step: step.name.clone(),
                });
            }
        }

        let mut saga = SagaInstance::new(
            definition,
            input,
            options.idempotency_key.clone(),
            options.deadline,
        );
        saga.touch_lease(&self.inner.owner_id, self.inner.config.lease_ttl);

        let saga_id = saga.saga_id;
        match self.inner.log.insert(&saga).await {
            Ok(()) => {}
            // Lost a submit race on the same idempotency key.
            Err(SagaLogError::DuplicateRequest { saga_id, .. }) => return Ok(saga_id),
            Err(e) => return Err(e.into()),
        }

        tracing::info!(%saga_id, definition = definition_id, "saga submitted");
        self.spawn_driver(saga, CancellationToken::new()).await;
        Ok(saga_id)
    }

    /// Returns the current saga instance.
    pub async fn status(&self, saga_id: SagaId) -> Result<SagaInstance> {
        self.inner
            .log
            .get(saga_id)
            .await?
            .ok_or(CoordinatorError::SagaNotFound(saga_id))
    }

    /// Aborts a non-terminal saga.
    ///
    /// A saga that has not run any step becomes `ABORTED`; otherwise the
    /// current step is treated as cancelled and compensation runs.
    #[tracing::instrument(skip(self))]
    pub async fn abort(&self, saga_id: SagaId) -> Result<()> {
        let saga = self.status(saga_id).await?;
        if saga.is_terminal() {
            return Err(CoordinatorError::InvalidTransition(
                TransitionError::InvalidStatus {
                    action: "abort",
                    status: saga.status,
                },
            ));
        }

        // A local driver observes its token and runs compensation itself.
        let token = self
            .inner
            .abort_tokens
            .lock()
            .unwrap()
            .get(&saga_id)
            .cloned();
        if let Some(token) = token {
            token.cancel();
            return Ok(());
        }

        // No local driver: claim the saga and settle it ourselves.
        let saga = self
            .inner
            .log
            .claim(saga_id, &self.inner.owner_id, self.inner.config.lease_ttl)
            .await?;
        let token = CancellationToken::new();
        token.cancel();
        self.spawn_driver(saga, token).await;
        Ok(())
    }

    /// Claims and resumes every recoverable non-terminal saga: expired
    /// leases, plus sagas this coordinator already owns. Returns how
    /// many drivers were spawned.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize> {
        let candidates = self.inner.log.scan_non_terminal().await?;
        let now = Utc::now();
        let mut resumed = 0;

        for saga in candidates {
            let ours = saga.owner_id.as_deref() == Some(self.inner.owner_id.as_str());
            if !ours && !saga.lease_expired(now) {
                continue;
            }
            // Already driving it in this process.
            if self
                .inner
                .abort_tokens
                .lock()
                .unwrap()
                .contains_key(&saga.saga_id)
            {
                continue;
            }
            if self.inner.registry.get(&saga.definition_id).is_none() {
                tracing::warn!(
                    saga_id = %saga.saga_id,
                    definition = %saga.definition_id,
                    "definition not registered, skipping recovery"
                );
                continue;
            }

            match self
                .inner
                .log
                .claim(saga.saga_id, &self.inner.owner_id, self.inner.config.lease_ttl)
                .await
            {
                Ok(claimed) => {
                    tracing::info!(saga_id = %claimed.saga_id, status = %claimed.status, "resuming saga");
                    self.spawn_driver(claimed, CancellationToken::new()).await;
                    resumed += 1;
                }
                // Someone else won the claim race.
                Err(SagaLogError::LeaseHeld { .. }) => continue,
                Err(e) => {
                    tracing::error!(saga_id = %saga.saga_id, error = %e, "failed to claim saga");
                }
            }
        }

        if resumed > 0 {
            tracing::info!(count = resumed, "saga recovery initiated");
        }
        Ok(resumed)
    }

    /// Spawns the periodic recovery scan; it stops at shutdown.
    pub fn spawn_recovery_loop(&self) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.inner.config.recovery_scan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = this.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = this.recover().await {
                            tracing::error!(error = %e, "recovery scan failed");
                        }
                    }
                }
            }
        })
    }

    /// Gracefully shuts down: stops accepting submits, lets in-flight
    /// adapter calls finish (bounded by their own timeouts), persists
    /// state between steps, and releases leases.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.shutdown.cancel();

        let mut drivers = self.inner.drivers.lock().await;
        while drivers.join_next().await.is_some() {}
        tracing::info!(owner = %self.inner.owner_id, "coordinator shut down");
    }

    async fn spawn_driver(&self, saga: SagaInstance, abort: CancellationToken) {
        let saga_id = saga.saga_id;
        self.inner
            .abort_tokens
            .lock()
            .unwrap()
            .insert(saga_id, abort.clone());

        let inner = self.inner.clone();
        self.inner.drivers.lock().await.spawn(async move {
            inner.drive(saga, abort).await;
            inner.abort_tokens.lock().unwrap().remove(&saga_id);
        });
    }
}

impl<L> Inner<L>
where
    L: SagaLogStore + Send + Sync + 'static,
{
    #[tracing::instrument(skip(self, saga, abort), fields(saga_id = %saga.saga_id))]
    async fn drive(&self, mut saga: SagaInstance, abort: CancellationToken) {
        metrics::counter!("saga_executions_total").increment(1);
        let saga_start = std::time::Instant::now();
        let saga_id = saga.saga_id;

        match self.run_saga(&mut saga, &abort).await {
            Ok(()) => {
                metrics::histogram!("saga_duration_seconds")
                    .record(saga_start.elapsed().as_secs_f64());
            }
            Err(CoordinatorError::Log(SagaLogError::LeaseLost { held_by, .. })) => {
                tracing::warn!(%saga_id, %held_by, "lease lost, another coordinator owns this saga");
            }
            Err(e) => {
                tracing::error!(%saga_id, error = %e, "saga driver failed");
            }
        }
    }

    async fn run_saga(&self, saga: &mut SagaInstance, abort: &CancellationToken) -> Result<()> {
        if saga.is_terminal() {
            // Claimed in a race with another driver finishing the saga.
            self.log.release(saga.saga_id, &self.owner_id).await?;
            return Ok(());
        }

        let definition = self
            .registry
            .get(&saga.definition_id)
            .ok_or_else(|| CoordinatorError::DefinitionNotFound(saga.definition_id.clone()))?
            .clone();

        if saga.status == SagaStatus::Started {
            if abort.is_cancelled() && !saga.has_begun() {
                saga.abort()?;
                return self.settle(saga).await;
            }
            saga.start_running()?;
            self.persist(saga).await?;
        }

        if saga.status == SagaStatus::Running {
            match self.run_forward(saga, &definition, abort).await? {
                Forward::Terminal => return Ok(()),
                Forward::Paused => {
                    self.log.release(saga.saga_id, &self.owner_id).await?;
                    return Ok(());
                }
                Forward::EnterCompensation => {}
            }
        }

        if saga.status == SagaStatus::Compensating {
            self.run_compensation(saga, &definition).await?;
        }
        Ok(())
    }

    /// Executes steps from the current cursor to the end of the
    /// definition, persisting before and after every invocation.
    async fn run_forward(
        &self,
        saga: &mut SagaInstance,
        definition: &SagaDefinition,
        abort: &CancellationToken,
    ) -> Result<Forward> {
        while saga.current_step_index < definition.len() {
            let i = saga.current_step_index;

            if self.shutdown.is_cancelled() {
                tracing::info!(saga_id = %saga.saga_id, step = i, "pausing saga for shutdown");
                return Ok(Forward::Paused);
            }
            if abort.is_cancelled() {
                saga.record_step_failed(i, ErrorKind::Canceled, "saga cancelled", 0)?;
                self.persist(saga).await?;
                return self.enter_compensation(saga, "cancelled by caller").await;
            }
            if saga.deadline_passed(Utc::now()) {
                saga.record_step_failed(i, ErrorKind::Timeout, "saga deadline exceeded", 0)?;
                self.persist(saga).await?;
                return self.enter_compensation(saga, "deadline exceeded").await;
            }

            let step = definition.steps[i].clone();
            let adapter = adapter_for(&self.participants, &step)?;

            // PENDING is durable before the call, so recovery knows this
            // step may already have taken effect at the participant.
            saga.begin_step(i)?;
            self.persist(saga).await?;

            tracing::info!(saga_id = %saga.saga_id, step = %step.name, "saga step started");
            let key = IdempotencyKey::for_step(saga.saga_id, i);
            let outcome = self
                .with_heartbeat(
                    saga.saga_id,
                    adapter.invoke(&step, &key, &saga.input_payload, abort),
                )
                .await;

            match outcome {
                Ok(ok) => {
                    saga.record_step_ok(i, ok.value, ok.attempts)?;
                    self.persist(saga).await?;
                    tracing::info!(saga_id = %saga.saga_id, step = %step.name, "saga step completed");
                }
                Err(failure) => {
                    metrics::counter!("saga_step_failures_total").increment(1);
                    let kind = failure.error.kind;
                    saga.record_step_failed(
                        i,
                        kind,
                        failure.error.message.clone(),
                        failure.attempts,
                    )?;
                    self.persist(saga).await?;

                    if kind == ErrorKind::FatalInternal {
                        tracing::error!(
                            saga_id = %saga.saga_id,
                            step = %step.name,
                            "fatal internal error, saga surfaced for operator"
                        );
                        return Ok(Forward::Paused);
                    }

                    tracing::warn!(
                        saga_id = %saga.saga_id,
                        step = %step.name,
                        error = %failure.error,
                        "saga step failed, compensating"
                    );
                    return self
                        .enter_compensation(
                            saga,
                            format!("step '{}' failed: {}", step.name, failure.error),
                        )
                        .await;
                }
            }
        }

        saga.complete()?;
        self.settle(saga).await?;
        Ok(Forward::Terminal)
    }

    async fn enter_compensation(
        &self,
        saga: &mut SagaInstance,
        reason: impl Into<String>,
    ) -> Result<Forward> {
        saga.begin_compensation(reason)?;
        self.persist(saga).await?;
        Ok(Forward::EnterCompensation)
    }

    /// Compensates completed steps in reverse order, best-effort: a
    /// failed compensation is recorded and the remaining steps still run.
    async fn run_compensation(
        &self,
        saga: &mut SagaInstance,
        definition: &SagaDefinition,
    ) -> Result<()> {
        metrics::counter!("saga_compensations_total").increment(1);

        for j in saga.compensation_indices() {
            if self.shutdown.is_cancelled() {
                tracing::info!(saga_id = %saga.saga_id, step = j, "pausing compensation for shutdown");
                self.log.release(saga.saga_id, &self.owner_id).await?;
                return Ok(());
            }

            let step = definition.steps[j].clone();
            if step.compensate_target.is_none() {
                // Nothing to undo.
                saga.record_step_compensated(j)?;
                self.persist(saga).await?;
                continue;
            }

            let Some(handle) = saga.step_results[j].handle.clone() else {
                saga.record_step_compensation_failed(
                    j,
                    ErrorKind::FatalInternal,
                    "completed step has no handle",
                )?;
                self.persist(saga).await?;
                continue;
            };

            saga.begin_step_compensation(j)?;
            self.persist(saga).await?;

            tracing::info!(saga_id = %saga.saga_id, step = %step.name, "compensating step");
            let key = IdempotencyKey::for_compensation(saga.saga_id, j);
            // Compensation must reach an outcome even for a cancelled
            // saga, so it never observes the abort token.
            let no_cancel = CancellationToken::new();
            let outcome = self
                .with_heartbeat(
                    saga.saga_id,
                    adapter_for(&self.participants, &step)?.compensate(
                        &step,
                        &key,
                        &handle,
                        &no_cancel,
                    ),
                )
                .await;

            match outcome {
                Ok(_) => {
                    saga.record_step_compensated(j)?;
                    self.persist(saga).await?;
                    tracing::info!(saga_id = %saga.saga_id, step = %step.name, "step compensated");
                }
                Err(failure) => {
                    saga.record_step_compensation_failed(
                        j,
                        failure.error.kind,
                        failure.error.message.clone(),
                    )?;
                    self.persist(saga).await?;
                    tracing::error!(
                        saga_id = %saga.saga_id,
                        step = %step.name,
                        error = %failure.error,
                        "compensation failed, continuing best-effort"
                    );
                }
            }
        }

        saga.finish_compensation()?;
        self.settle(saga).await
    }

    /// Persists the row, refreshing this coordinator's lease.
    async fn persist(&self, saga: &mut SagaInstance) -> Result<()> {
        saga.touch_lease(&self.owner_id, self.config.lease_ttl);
        self.log.save(saga, &self.owner_id).await?;
        Ok(())
    }

    /// Writes a terminal row with the lease cleared and emits the
    /// lifecycle notification.
    async fn settle(&self, saga: &mut SagaInstance) -> Result<()> {
        saga.clear_lease();
        self.log.save(saga, &self.owner_id).await?;
        self.publish_lifecycle(saga).await;

        match saga.status {
            SagaStatus::Completed => {
                metrics::counter!("saga_completed").increment(1);
                tracing::info!(saga_id = %saga.saga_id, "saga completed");
            }
            SagaStatus::Compensated => {
                metrics::counter!("saga_compensated").increment(1);
                tracing::warn!(
                    saga_id = %saga.saga_id,
                    reason = saga.failure_reason.as_deref().unwrap_or("unknown"),
                    "saga compensated"
                );
            }
            SagaStatus::CompensationFailed => {
                metrics::counter!("saga_compensation_failed").increment(1);
                tracing::error!(
                    saga_id = %saga.saga_id,
                    "saga compensation failed, operator intervention required"
                );
            }
            SagaStatus::Aborted => {
                metrics::counter!("saga_aborted").increment(1);
                tracing::info!(saga_id = %saga.saga_id, "saga aborted");
            }
            _ => {}
        }
        Ok(())
    }

    async fn publish_lifecycle(&self, saga: &SagaInstance) {
        let Some(bus) = &self.lifecycle_bus else {
            return;
        };
        let event_type = match saga.status {
            SagaStatus::Completed => "SagaCompleted",
            SagaStatus::Compensated => "SagaCompensated",
            SagaStatus::CompensationFailed => "SagaCompensationFailed",
            SagaStatus::Aborted => "SagaAborted",
            _ => return,
        };

        let message = BusMessage {
            key: saga.saga_id.to_string(),
            event_id: EventId::new(),
            event_type: event_type.to_string(),
            aggregate_type: "Saga".to_string(),
            created_at: Utc::now(),
            payload: serde_json::json!({
                "saga_id": saga.saga_id,
                "definition_id": saga.definition_id,
                "status": saga.status,
            }),
        };
        if let Err(e) = bus.publish(message).await {
            tracing::warn!(saga_id = %saga.saga_id, error = %e, "lifecycle publish failed");
        }
    }

    /// Awaits an adapter call while renewing the saga lease at the
    /// heartbeat cadence, so a long call does not let the lease lapse.
    async fn with_heartbeat<F, T>(&self, saga_id: SagaId, call: F) -> T
    where
        F: Future<Output = T>,
    {
        tokio::pin!(call);
        let mut ticker = tokio::time::interval(self.config.heartbeat);
        // The first tick is immediate.
        ticker.tick().await;

        loop {
            tokio::select! {
                outcome = &mut call => return outcome,
                _ = ticker.tick() => {
                    if let Err(e) = self
                        .log
                        .renew_lease(saga_id, &self.owner_id, self.config.lease_ttl)
                        .await
                    {
                        tracing::warn!(%saga_id, error = %e, "lease renewal failed during call");
                    }
                }
            }
        }
    }
}

fn adapter_for<'a>(
    participants: &'a HashMap<String, ParticipantAdapter>,
    step: &saga_core::StepDefinition,
) -> Result<&'a ParticipantAdapter> {
    participants
        .get(&step.service)
        .ok_or_else(|| CoordinatorError::UnknownParticipant {
            service: step.service.clone(),
            step: step.name.clone(),
        })
}
