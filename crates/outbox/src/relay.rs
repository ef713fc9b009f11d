//! Background relay that drains pending outbox rows to the event bus.

use std::collections::HashMap;
use std::time::Duration;

use event_bus::EventBus;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::row::{OutboxRow, OutboxStatus};
use crate::store::ParticipantStore;
use crate::Result;

/// Relay cadence and thresholds.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How often the outbox table is polled.
    pub poll_interval: Duration,
    /// Maximum rows fetched per tick.
    pub batch_size: usize,
    /// Publish attempts before a row is parked as `DEAD`.
    pub dead_attempts: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            dead_attempts: 50,
        }
    }
}

/// Per-participant worker that publishes pending outbox rows.
///
/// Rows are grouped by `aggregate_id`; each group publishes serially in
/// `created_at` order while different groups run concurrently, which
/// gives FIFO delivery per aggregate and no ordering across aggregates.
/// A failed publish leaves the row `PENDING` for the next tick, so no
/// in-process queue ever grows under bus backpressure.
pub struct OutboxRelay<S, B> {
    participant: String,
    store: S,
    bus: B,
    config: RelayConfig,
}

impl<S, B> OutboxRelay<S, B>
where
    S: ParticipantStore,
    B: EventBus,
{
    /// Creates a relay for one participant's store.
    pub fn new(participant: impl Into<String>, store: S, bus: B, config: RelayConfig) -> Self {
        Self {
            participant: participant.into(),
            store,
            bus,
            config,
        }
    }

    /// Runs the poll loop until the cancellation token fires.
    #[tracing::instrument(skip(self, cancel), fields(participant = %self.participant))]
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("outbox relay stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_once().await {
                        tracing::error!(error = %e, "outbox drain failed");
                    }
                }
            }
        }
    }

    /// Fetches one batch and publishes it. Returns the number of rows
    /// delivered this pass.
    pub async fn drain_once(&self) -> Result<usize> {
        let batch = self.store.fetch_pending(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        tracing::debug!(rows = batch.len(), "relaying outbox batch");

        // Group by aggregate, preserving fetch order within each group.
        let mut groups: HashMap<String, Vec<OutboxRow>> = HashMap::new();
        for row in batch {
            groups.entry(row.aggregate_id.clone()).or_default().push(row);
        }

        let published = join_all(groups.into_values().map(|group| self.drain_group(group)))
            .await
            .into_iter()
            .sum();

        Ok(published)
    }

    /// Publishes one aggregate's rows serially; stops the group at the
    /// first failure so per-aggregate order is preserved.
    async fn drain_group(&self, group: Vec<OutboxRow>) -> usize {
        let mut published = 0;
        for row in group {
            let event_id = row.event_id;
            match self.bus.publish(row.to_bus_message()).await {
                Ok(()) => {
                    if let Err(e) = self.store.mark_delivered(event_id).await {
                        tracing::error!(%event_id, error = %e, "failed to mark row delivered");
                        break;
                    }
                    metrics::counter!("outbox_published_total").increment(1);
                    published += 1;
                }
                Err(e) => {
                    metrics::counter!("outbox_publish_failures_total").increment(1);
                    tracing::warn!(%event_id, error = %e, "publish failed, row stays pending");
                    match self
                        .store
                        .record_publish_failure(event_id, self.config.dead_attempts)
                        .await
                    {
                        Ok(OutboxStatus::Dead) => {
                            metrics::counter!("outbox_dead_total").increment(1);
                            tracing::error!(%event_id, "outbox row parked as DEAD");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(%event_id, error = %e, "failed to record publish failure");
                        }
                    }
                    // Later rows for this aggregate must wait for this one.
                    break;
                }
            }
        }
        published
    }
}
