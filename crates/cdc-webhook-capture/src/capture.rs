//! The event-capture routine.
//!
//! One call per row change. Every binding on the changed table whose
//! operation set and timing match is evaluated independently: UPDATEs pass
//! through the binding's column filter, then the event is either delivered
//! inline or enqueued. SYNC bindings run before ASYNC ones, so an aborting
//! SYNC failure returns before anything has been enqueued.

use std::sync::Arc;

use cdc_webhook_core::{
    ChangeEvent, Clock, DispatchMode, EventQueueRecord, Operation, QueueRecordId, TableIdentity,
    TraceContext, TriggerBinding, TriggerKey, TriggerTiming,
};
use cdc_webhook_delivery::{
    CredentialResolver, DeliveryError, QueueStorage, SyncCoordinator, SyncDelivery,
};
use serde_json::Value;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    error::{CaptureError, Result},
    filter::UpdateColumnFilter,
    storage::BindingStorage,
};

/// One row-level mutation as seen by the producer.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    /// Table that changed.
    pub table: TableIdentity,
    /// Kind of change.
    pub op: Operation,
    /// Trigger timing this call is made at.
    pub timing: TriggerTiming,
    /// Row before the change.
    pub old: Option<Value>,
    /// Row after the change.
    pub new: Option<Value>,
    /// Trace ids to propagate.
    pub trace_context: Option<TraceContext>,
}

impl RowChange {
    /// AFTER change with no trace context.
    pub fn after(table: TableIdentity, op: Operation, old: Option<Value>, new: Option<Value>) -> Self {
        Self { table, op, timing: TriggerTiming::After, old, new, trace_context: None }
    }
}

/// What happened to a row change that was not aborted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureReport {
    /// SYNC bindings whose sink accepted the event.
    pub delivered: Vec<TriggerKey>,
    /// Queue records created for ASYNC bindings.
    pub queued: Vec<QueueRecordId>,
    /// Exhaustion warnings from SYNC bindings without `cancel_on_failure`.
    pub warnings: Vec<String>,
    /// Bindings whose column filter rejected the UPDATE.
    pub filtered: Vec<TriggerKey>,
}

/// Evaluates bindings for row changes and dispatches events.
#[derive(Clone)]
pub struct EventCapture {
    bindings: Arc<dyn BindingStorage>,
    queue: Arc<dyn QueueStorage>,
    resolver: CredentialResolver,
    coordinator: SyncCoordinator,
    clock: Arc<dyn Clock>,
}

impl EventCapture {
    /// Creates a capture routine.
    pub fn new(
        bindings: Arc<dyn BindingStorage>,
        queue: Arc<dyn QueueStorage>,
        resolver: CredentialResolver,
        coordinator: SyncCoordinator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { bindings, queue, resolver, coordinator, clock }
    }

    /// Processes one row change against every matching binding.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Aborted` when a SYNC binding with
    /// `cancel_on_failure` exhausts its attempts; the caller must roll back
    /// the change. Storage failures surface as `CaptureError::Storage`.
    pub async fn capture(&self, change: RowChange) -> Result<CaptureReport> {
        let span = info_span!("capture", table = %change.table, op = %change.op);

        async move {
            let mut bindings: Vec<TriggerBinding> = self
                .bindings
                .bindings_for_table(change.table.clone())
                .await?
                .into_iter()
                .filter(|binding| binding.fires_on(change.op, change.timing))
                .collect();
            bindings.sort_by_key(|binding| binding.dispatch != DispatchMode::Sync);

            let mut report = CaptureReport::default();
            for binding in &bindings {
                if change.op == Operation::Update
                    && !UpdateColumnFilter::new(binding.update_columns.as_deref())
                        .admits(change.old.as_ref(), change.new.as_ref())
                {
                    debug!(trigger = %binding.key, "update filtered out by column list");
                    report.filtered.push(binding.key.clone());
                    continue;
                }

                let event = self.build_event(binding, &change);
                match binding.dispatch {
                    DispatchMode::Sync => self.deliver(binding, &event, &mut report).await?,
                    DispatchMode::Async => {
                        let id = self.enqueue(binding, event).await?;
                        report.queued.push(id);
                    },
                }
            }

            Ok(report)
        }
        .instrument(span)
        .await
    }

    fn build_event(&self, binding: &TriggerBinding, change: &RowChange) -> ChangeEvent {
        let event = ChangeEvent::new(
            change.table.clone(),
            binding.trigger_identity(),
            change.op,
            change.old.clone(),
            change.new.clone(),
            self.clock.now_utc(),
        );
        match &change.trace_context {
            Some(trace) => event.with_trace_context(trace.clone()),
            None => event,
        }
    }

    async fn deliver(
        &self,
        binding: &TriggerBinding,
        event: &ChangeEvent,
        report: &mut CaptureReport,
    ) -> Result<()> {
        let target =
            match self.resolver.resolve(&binding.key, &binding.source, binding.timeout_seconds).await {
                Ok(target) => target,
                Err(error @ DeliveryError::CredentialsNotFound { .. }) => {
                    let exhausted = DeliveryError::exhausted(
                        format!("Attempt 1/1 failed. {error}."),
                        0,
                        binding.cancel_on_failure,
                    );
                    return self.exhausted(exhausted, report);
                },
                Err(error) => return Err(error.into()),
            };

        let delivery = SyncDelivery {
            event,
            target: &target,
            retry_policy: binding.retry_policy,
            cancel_on_failure: binding.cancel_on_failure,
        };

        match self.coordinator.deliver(delivery).await {
            Ok(outcome) => match outcome.warning {
                Some(warning) => report.warnings.push(warning),
                None => report.delivered.push(binding.key.clone()),
            },
            Err(error) => return Err(error.into()),
        }
        Ok(())
    }

    fn exhausted(&self, error: DeliveryError, report: &mut CaptureReport) -> Result<()> {
        match error {
            DeliveryError::Exhausted { abort: true, .. } => {
                error!("{error}");
                Err(error.into())
            },
            DeliveryError::Exhausted { .. } => {
                warn!("{error}");
                report.warnings.push(error.to_string());
                Ok(())
            },
            other => Err(other.into()),
        }
    }

    /// Stores an event for later delivery by the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Configuration` for a binding with
    /// `cancel_on_failure`, since a queued delivery can no longer abort the
    /// change that produced it, or `CaptureError::Storage` if the insert
    /// fails.
    pub async fn enqueue(&self, binding: &TriggerBinding, event: ChangeEvent) -> Result<QueueRecordId> {
        if binding.cancel_on_failure {
            return Err(CaptureError::configuration(
                "cancel_on_failure cannot be combined with ASYNC dispatch",
            ));
        }

        let record = EventQueueRecord::new(
            binding.key.clone(),
            binding.source.clone(),
            event,
            binding.timeout_seconds,
            binding.retry_policy,
            self.clock.now_utc(),
        );
        let id = self.queue.enqueue(record).await?;

        info!(trigger = %binding.key, record_id = %id, "change event queued");
        Ok(id)
    }
}
