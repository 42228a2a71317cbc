//! Builders for change events and trigger bindings with test defaults.

use cdc_webhook_core::{
    Backoff, ChangeEvent, DispatchMode, Operation, RetryPolicy, TableIdentity, TargetSource,
    TraceContext, TriggerBinding, TriggerIdentity, TriggerKey, TriggerTiming, WebhookHeaders,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

/// `public.employees`, the table most tests capture from.
pub fn employees() -> TableIdentity {
    TableIdentity::new("public", "employees")
}

/// Fixed timestamp for snapshot-stable payloads.
pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().unwrap_or_else(Utc::now)
}

/// Sample employee row.
pub fn employee_row(id: i64, name: &str, salary: i64) -> Value {
    json!({"id": id, "name": name, "salary": salary})
}

/// Builder for [`ChangeEvent`].
pub struct ChangeEventBuilder {
    table: TableIdentity,
    trigger: TriggerIdentity,
    op: Operation,
    old: Option<Value>,
    new: Option<Value>,
    created_at: DateTime<Utc>,
    trace_context: Option<TraceContext>,
}

impl ChangeEventBuilder {
    /// INSERT on `public.employees` with a sample row.
    pub fn insert() -> Self {
        Self::new(Operation::Insert).new_row(employee_row(1, "Ada", 1000))
    }

    /// UPDATE on `public.employees` raising the sample row's salary.
    pub fn update() -> Self {
        Self::new(Operation::Update)
            .old_row(employee_row(1, "Ada", 1000))
            .new_row(employee_row(1, "Ada", 1200))
    }

    /// DELETE on `public.employees` of the sample row.
    pub fn delete() -> Self {
        Self::new(Operation::Delete).old_row(employee_row(1, "Ada", 1000))
    }

    fn new(op: Operation) -> Self {
        Self {
            table: employees(),
            trigger: TriggerIdentity::new("employee_changes", Some(TriggerTiming::After)),
            op,
            old: None,
            new: None,
            created_at: fixed_time(),
            trace_context: None,
        }
    }

    /// Sets the table.
    #[must_use]
    pub fn table(mut self, table: TableIdentity) -> Self {
        self.table = table;
        self
    }

    /// Sets the trigger identity.
    #[must_use]
    pub fn trigger(mut self, name: impl Into<String>, timing: Option<TriggerTiming>) -> Self {
        self.trigger = TriggerIdentity::new(name, timing);
        self
    }

    /// Sets the row before the change.
    #[must_use]
    pub fn old_row(mut self, row: Value) -> Self {
        self.old = Some(row);
        self
    }

    /// Sets the row after the change.
    #[must_use]
    pub fn new_row(mut self, row: Value) -> Self {
        self.new = Some(row);
        self
    }

    /// Sets the creation timestamp.
    #[must_use]
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Attaches trace ids.
    #[must_use]
    pub fn traced(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.trace_context = Some(TraceContext { trace_id: trace_id.into(), span_id: span_id.into() });
        self
    }

    /// Builds the event.
    pub fn build(self) -> ChangeEvent {
        let event =
            ChangeEvent::new(self.table, self.trigger, self.op, self.old, self.new, self.created_at);
        match self.trace_context {
            Some(trace) => event.with_trace_context(trace),
            None => event,
        }
    }
}

/// Builder for [`TriggerBinding`].
///
/// Defaults: all operations, AFTER timing, no retries, five second timeout,
/// SYNC dispatch, inline target with no headers.
pub struct BindingBuilder {
    binding: TriggerBinding,
}

impl BindingBuilder {
    /// Binding `name` on `public.employees` delivering to `url`.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            binding: TriggerBinding {
                key: TriggerKey::new(employees(), name),
                operations: vec![Operation::Insert, Operation::Update, Operation::Delete],
                timing: TriggerTiming::After,
                update_columns: None,
                source: TargetSource::Inline { url: url.into(), headers: WebhookHeaders::new() },
                timeout_seconds: 5,
                cancel_on_failure: false,
                retry_policy: RetryPolicy::no_retries(),
                dispatch: DispatchMode::Sync,
            },
        }
    }

    /// Restricts the operations.
    #[must_use]
    pub fn operations(mut self, operations: &[Operation]) -> Self {
        self.binding.operations = operations.to_vec();
        self
    }

    /// Sets the timing.
    #[must_use]
    pub fn timing(mut self, timing: TriggerTiming) -> Self {
        self.binding.timing = timing;
        self
    }

    /// Restricts UPDATE firing to changes in `columns`.
    #[must_use]
    pub fn update_columns(mut self, columns: &[&str]) -> Self {
        self.binding.update_columns = Some(columns.iter().map(|c| (*c).to_string()).collect());
        self
    }

    /// Adds an inline header. No effect on stored sources.
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let TargetSource::Inline { headers, .. } = &mut self.binding.source {
            headers.insert(name, value);
        }
        self
    }

    /// Switches to credentials looked up per delivery.
    #[must_use]
    pub fn stored(mut self) -> Self {
        self.binding.source = TargetSource::Stored;
        self
    }

    /// Sets the retry policy.
    ///
    /// # Panics
    ///
    /// Panics if `interval_seconds` is zero.
    #[must_use]
    pub fn retries(mut self, max_retries: u32, interval_seconds: u32, backoff: Backoff) -> Self {
        self.binding.retry_policy =
            RetryPolicy::new(max_retries, interval_seconds, backoff).expect("invalid retry policy");
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u32) -> Self {
        self.binding.timeout_seconds = seconds;
        self
    }

    /// Aborts the producing unit of work on exhaustion.
    #[must_use]
    pub fn cancel_on_failure(mut self) -> Self {
        self.binding.cancel_on_failure = true;
        self
    }

    /// Queues events instead of delivering inline.
    #[must_use]
    pub fn queued(mut self) -> Self {
        self.binding.dispatch = DispatchMode::Async;
        self
    }

    /// Builds the binding.
    pub fn build(self) -> TriggerBinding {
        self.binding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_event_has_no_old_row() {
        let event = ChangeEventBuilder::insert().build();
        assert!(event.old().is_none());
        assert_eq!(event.new_row(), Some(&employee_row(1, "Ada", 1000)));
    }

    #[test]
    fn header_is_ignored_for_stored_source() {
        let binding = BindingBuilder::new("t", "http://sink").stored().header("A", "b").build();
        assert_eq!(binding.source, TargetSource::Stored);
    }
}
