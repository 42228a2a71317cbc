//! Synchronous delivery: attempts, sleeps and the final abort-or-warn
//! decision, all on the caller's task.
//!
//! Attempt 0 runs immediately. Before attempt `i > 0` the coordinator sleeps
//! `retry_policy.delay(i - 1)` on its clock. The loop stops at the first
//! success or after `max_retries + 1` attempts. Failures accumulate into a
//! single message of the form
//! `Attempt 1/3 failed. HTTP 401. Attempt 2/3 failed. transport error: ...`.

use std::{fmt::Write as _, sync::Arc};

use bytes::Bytes;
use cdc_webhook_core::{ChangeEvent, Clock, DeliveryInfo, RetryPolicy, WebhookTarget};
use tracing::{error, info, warn};

use crate::{
    client::{AttemptRequest, DeliveryClient},
    error::{DeliveryError, Result},
};

/// One synchronous delivery sequence.
#[derive(Debug, Clone, Copy)]
pub struct SyncDelivery<'a> {
    /// Event to deliver.
    pub event: &'a ChangeEvent,
    /// Resolved destination.
    pub target: &'a WebhookTarget,
    /// Attempt budget and spacing.
    pub retry_policy: RetryPolicy,
    /// Whether exhaustion aborts the producing unit of work.
    pub cancel_on_failure: bool,
}

/// Result of a sequence that did not abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Attempts made.
    pub attempts: u32,
    /// Set when every attempt failed and the failure was downgraded.
    pub warning: Option<String>,
}

impl DeliveryReport {
    /// Whether the sink accepted the event.
    pub fn is_delivered(&self) -> bool {
        self.warning.is_none()
    }
}

/// Drives the executor and the retry scheduler to completion.
#[derive(Clone)]
pub struct SyncCoordinator {
    client: DeliveryClient,
    clock: Arc<dyn Clock>,
}

impl SyncCoordinator {
    /// Creates a coordinator sleeping on `clock` between attempts.
    pub fn new(client: DeliveryClient, clock: Arc<dyn Clock>) -> Self {
        Self { client, clock }
    }

    /// Delivers one event, retrying per policy.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Exhausted` with `abort = true` when every
    /// attempt failed and `cancel_on_failure` is set. Without
    /// `cancel_on_failure` exhaustion is reported through
    /// [`DeliveryReport::warning`] instead.
    pub async fn deliver(&self, delivery: SyncDelivery<'_>) -> Result<DeliveryReport> {
        let policy = delivery.retry_policy;
        let total = policy.total_attempts();
        let mut failures = String::new();

        for index in 0..total {
            if index > 0 {
                let delay = policy.delay(index - 1);
                info!(
                    event_id = %delivery.event.id(),
                    delay_seconds = delay.as_secs(),
                    attempt = index + 1,
                    total,
                    "retrying webhook call"
                );
                self.clock.sleep(delay).await;
            }

            let info = DeliveryInfo { max_retries: policy.max_retries(), current_retry: index };
            let body = Bytes::from(delivery.event.to_body(Some(info))?);
            let outcome = self
                .client
                .execute(AttemptRequest {
                    event_id: delivery.event.id(),
                    attempt: index + 1,
                    body,
                    target: delivery.target,
                })
                .await;

            match DeliveryError::from_outcome(&outcome) {
                None => return Ok(DeliveryReport { attempts: index + 1, warning: None }),
                Some(failure) => {
                    let _ = write!(failures, "Attempt {}/{total} failed. {failure}. ", index + 1);
                },
            }
        }

        let message = failures.trim_end().to_string();
        if delivery.cancel_on_failure {
            error!(event_id = %delivery.event.id(), "webhook delivery failed: {message}");
            return Err(DeliveryError::exhausted(message, total, true));
        }

        let warning = DeliveryError::exhausted(message, total, false).to_string();
        warn!(event_id = %delivery.event.id(), "{warning}");
        Ok(DeliveryReport { attempts: total, warning: Some(warning) })
    }
}
