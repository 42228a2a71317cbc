//! Dispatcher worker draining the event queue.
//!
//! The loop sleeps one poll interval, claims due records, and sends each one
//! exactly one attempt before writing the outcome back. Configuration comes
//! in through a `watch` channel and is re-read at every iteration boundary;
//! termination comes in through a `CancellationToken` and is honoured at the
//! same boundaries, so a claimed batch is always finished before exit.
//!
//! Every claimed record leaves IN_PROGRESS through `record_outcome`, even
//! when the attempt could not be sent. Records stranded by a crash or a lost
//! outcome write are returned to PENDING by the stale sweep, which runs at
//! start and again once per `stale_after` while the loop is running.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use cdc_webhook_core::{Clock, DeliveryOutcome, EventQueueRecord, QueueStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{AttemptRequest, DeliveryClient},
    credentials::CredentialResolver,
    error::{DeliveryError, Result},
    storage::QueueStorage,
};

/// Runtime settings of the dispatcher, reloadable without restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Pause between polls.
    pub poll_interval: Duration,
    /// Most records claimed per poll.
    pub batch_size: usize,
    /// Age after which an IN_PROGRESS record counts as abandoned.
    pub stale_after: Duration,
    /// Pause before the supervisor restarts a failed worker.
    pub restart_delay: Duration,
    /// How long shutdown waits for the worker to stop.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: crate::DEFAULT_BATCH_SIZE,
            stale_after: Duration::from_secs(300),
            restart_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Single consumer of the event queue.
///
/// Clones share storage, client, clock, configuration channel and
/// cancellation token; the supervisor clones a fresh instance per start.
#[derive(Clone)]
pub struct DispatcherWorker {
    queue: Arc<dyn QueueStorage>,
    resolver: CredentialResolver,
    client: DeliveryClient,
    clock: Arc<dyn Clock>,
    config: watch::Receiver<DispatcherConfig>,
    cancellation_token: CancellationToken,
}

impl DispatcherWorker {
    /// Creates a worker.
    pub fn new(
        queue: Arc<dyn QueueStorage>,
        resolver: CredentialResolver,
        client: DeliveryClient,
        clock: Arc<dyn Clock>,
        config: watch::Receiver<DispatcherConfig>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { queue, resolver, client, clock, config, cancellation_token }
    }

    /// Token that stops the worker at its next iteration boundary.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Configuration currently in effect.
    pub fn current_config(&self) -> DispatcherConfig {
        self.config.borrow().clone()
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Main loop: reclaim abandoned records, then poll until cancelled,
    /// sweeping for stale records again every `stale_after`.
    ///
    /// # Errors
    ///
    /// Returns an error when reclaiming or claiming fails; the supervisor
    /// restarts the worker after its restart delay.
    pub async fn run(&mut self) -> Result<()> {
        info!("dispatcher worker starting");
        self.reclaim_stale().await?;
        let mut last_sweep = self.clock.now();

        loop {
            if self.cancellation_token.is_cancelled() {
                info!("dispatcher worker received shutdown signal");
                break;
            }

            if self.config.has_changed().unwrap_or(false) {
                let config = self.config.borrow_and_update().clone();
                info!(
                    poll_interval_ms = config.poll_interval.as_millis(),
                    batch_size = config.batch_size,
                    "dispatcher configuration reloaded"
                );
            }

            let poll_interval = self.config.borrow().poll_interval;
            tokio::select! {
                () = self.clock.sleep(poll_interval) => {}
                () = self.cancellation_token.cancelled() => break,
            }

            self.process_due().await?;

            let stale_after = self.config.borrow().stale_after;
            if self.clock.now().saturating_duration_since(last_sweep) >= stale_after {
                self.reclaim_stale().await?;
                last_sweep = self.clock.now();
            }
        }

        info!("dispatcher worker stopped");
        Ok(())
    }

    /// Returns records abandoned IN_PROGRESS to PENDING.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the update fails.
    pub async fn reclaim_stale(&self) -> Result<u64> {
        let stale_after = self.config.borrow().stale_after;
        let now = self.clock.now_utc();
        let stale_before = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let reclaimed = self.queue.reclaim_stale(now, stale_before).await?;
        if reclaimed > 0 {
            warn!(reclaimed, "reclaimed abandoned in-progress records");
        }
        Ok(reclaimed)
    }

    /// Claims one batch of due records and makes one attempt for each.
    ///
    /// Returns the number of records claimed. A failure on one record is
    /// logged and does not stop the rest of the batch; a record whose
    /// outcome could not be written is left for the stale sweep.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if claiming fails.
    pub async fn process_due(&self) -> Result<usize> {
        let batch_size = self.config.borrow().batch_size;
        let records = self
            .queue
            .claim_due(self.clock.now_utc(), batch_size)
            .await
            .map_err(|e| DeliveryError::storage(format!("failed to claim due records: {e}")))?;

        let claimed = records.len();
        if claimed > 0 {
            debug!(claimed, "claimed due queue records");
        }

        for record in records {
            let id = record.id;
            if let Err(error) = self.process_record(record).await {
                error!(record_id = %id, error = %error, "queue record processing failed");
            }
        }

        Ok(claimed)
    }

    async fn process_record(&self, record: EventQueueRecord) -> Result<QueueStatus> {
        let attempt = record.attempt_count + 1;
        let total = record.retry_policy.total_attempts();

        let outcome = match self.attempt(&record, attempt).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(record_id = %record.id, attempt, error = %error, "attempt not sent");
                DeliveryOutcome::not_attempted(error.to_string())
            },
        };

        let updated = self.queue.record_outcome(record.id, outcome, self.clock.now_utc()).await?;

        match updated.status {
            QueueStatus::Delivered => {
                info!(record_id = %updated.id, attempt, "queued webhook delivered");
            },
            QueueStatus::Pending => {
                info!(
                    record_id = %updated.id,
                    attempt,
                    total,
                    next_attempt = ?updated.next_attempt,
                    "retrying webhook call"
                );
            },
            QueueStatus::Failed => {
                warn!(
                    record_id = %updated.id,
                    trigger = %updated.trigger,
                    attempts = updated.attempt_count,
                    last_status = ?updated.attempt_statuses.last().copied().flatten(),
                    "webhook delivery failed"
                );
            },
            QueueStatus::InProgress => {},
        }

        Ok(updated.status)
    }

    /// Resolves the target and sends one attempt. Errors mean nothing was
    /// sent; they still count as a failed attempt.
    async fn attempt(&self, record: &EventQueueRecord, attempt: u32) -> Result<DeliveryOutcome> {
        let target =
            self.resolver.resolve(&record.trigger, &record.source, record.timeout_seconds).await?;
        let body = record
            .payload
            .to_body(Some(record.delivery_info()))
            .map_err(|e| DeliveryError::configuration(format!("failed to encode payload: {e}")))?;

        Ok(self
            .client
            .execute(AttemptRequest {
                event_id: record.payload.id(),
                attempt,
                body: Bytes::from(body),
                target: &target,
            })
            .await)
    }
}
