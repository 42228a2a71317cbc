//! Domain models for change events, delivery targets and trigger bindings.
//!
//! The `ChangeEvent` serializes directly into the wire payload that webhook
//! sinks receive, so its serde shape is part of the external contract:
//!
//! ```json
//! {
//!   "id": "…",
//!   "created_at": "2024-05-01T12:00:00Z",
//!   "table": {"schema": "public", "name": "employees"},
//!   "trigger": {"name": "employee_insert", "timing": "AFTER"},
//!   "event": {"op": "INSERT", "data": {"old": null, "new": {"id": 1}}},
//!   "delivery_info": {"max_retries": 3, "current_retry": 0}
//! }
//! ```

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    headers::WebhookHeaders,
    retry::RetryPolicy,
};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed change event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Row-level operation that produced a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "INSERT"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

impl FromStr for Operation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            _ => Err(CoreError::invalid_input(format!(
                "operation must be INSERT, UPDATE or DELETE, got '{s}'"
            ))),
        }
    }
}

/// When a trigger fires relative to the row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerTiming {
    /// Before the row change is applied.
    Before,
    /// After the row change is applied.
    #[default]
    After,
}

impl fmt::Display for TriggerTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Before => write!(f, "BEFORE"),
            Self::After => write!(f, "AFTER"),
        }
    }
}

impl FromStr for TriggerTiming {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BEFORE" => Ok(Self::Before),
            "AFTER" => Ok(Self::After),
            _ => Err(CoreError::invalid_input(format!(
                "trigger_timing must be BEFORE or AFTER, got '{s}'"
            ))),
        }
    }
}

/// Where a binding's URL and headers live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityMode {
    /// URL and headers are kept inline with the binding.
    #[default]
    None,
    /// URL and headers are kept in the protected credential store.
    Private,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Private => write!(f, "PRIVATE"),
        }
    }
}

impl FromStr for SecurityMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(Self::None),
            "PRIVATE" => Ok(Self::Private),
            _ => Err(CoreError::invalid_input(format!(
                "security must be NONE or PRIVATE, got '{s}'"
            ))),
        }
    }
}

/// Whether delivery happens inline or through the event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DispatchMode {
    /// Deliver on the producing caller, blocking it.
    #[default]
    Sync,
    /// Enqueue and let the dispatcher worker deliver later.
    Async,
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "SYNC"),
            Self::Async => write!(f, "ASYNC"),
        }
    }
}

impl FromStr for DispatchMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SYNC" => Ok(Self::Sync),
            "ASYNC" => Ok(Self::Async),
            _ => Err(CoreError::invalid_input(format!(
                "dispatch must be SYNC or ASYNC, got '{s}'"
            ))),
        }
    }
}

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableIdentity {
    /// Schema the table lives in.
    pub schema: String,
    /// Unqualified table name.
    pub name: String,
}

impl TableIdentity {
    /// Creates a table identity.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self { schema: schema.into(), name: name.into() }
    }
}

impl fmt::Display for TableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Trigger name and timing as carried in the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerIdentity {
    /// Trigger name.
    pub name: String,
    /// Trigger timing, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<TriggerTiming>,
}

impl TriggerIdentity {
    /// Creates a trigger identity.
    pub fn new(name: impl Into<String>, timing: Option<TriggerTiming>) -> Self {
        Self { name: name.into(), timing }
    }
}

/// Unique key of a trigger binding: its table plus trigger name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerKey {
    /// Table the trigger is attached to.
    pub table: TableIdentity,
    /// Trigger name, unique per table.
    pub trigger_name: String,
}

impl TriggerKey {
    /// Creates a trigger key.
    pub fn new(table: TableIdentity, trigger_name: impl Into<String>) -> Self {
        Self { table, trigger_name: trigger_name.into() }
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.trigger_name)
    }
}

/// Trace correlation ids propagated from the producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// Trace id.
    pub trace_id: String,
    /// Span id.
    pub span_id: String,
}

/// Before/after row snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowData {
    /// Row before the change; null for INSERT.
    pub old: Option<Value>,
    /// Row after the change; null for DELETE.
    pub new: Option<Value>,
}

/// The `event` block of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
    /// Operation that produced the event.
    pub op: Operation,
    /// Row snapshots.
    pub data: RowData,
    /// Optional trace correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<TraceContext>,
}

/// Retry position attached to an outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    /// Retries the policy allows after the first attempt.
    pub max_retries: u32,
    /// 0-based index of this attempt.
    pub current_retry: u32,
}

/// Structured description of one row-level mutation.
///
/// Built once by the capture routine and never mutated afterwards; the
/// constructor enforces that INSERT carries no `old` row and DELETE carries
/// no `new` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    id: EventId,
    created_at: DateTime<Utc>,
    table: TableIdentity,
    trigger: TriggerIdentity,
    event: EventBody,
}

/// Serialized request body: the event plus optional delivery info.
#[derive(Serialize)]
struct WirePayload<'a> {
    #[serde(flatten)]
    event: &'a ChangeEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    delivery_info: Option<DeliveryInfo>,
}

impl ChangeEvent {
    /// Builds a change event with a fresh id.
    pub fn new(
        table: TableIdentity,
        trigger: TriggerIdentity,
        op: Operation,
        old: Option<Value>,
        new: Option<Value>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let (old, new) = match op {
            Operation::Insert => (None, new),
            Operation::Update => (old, new),
            Operation::Delete => (old, None),
        };

        Self {
            id: EventId::new(),
            created_at,
            table,
            trigger,
            event: EventBody {
                op,
                data: RowData { old: old.filter(|v| !v.is_null()), new: new.filter(|v| !v.is_null()) },
                trace_context: None,
            },
        }
    }

    /// Attaches trace correlation ids.
    pub fn with_trace_context(mut self, trace_context: TraceContext) -> Self {
        self.event.trace_context = Some(trace_context);
        self
    }

    /// Replaces the generated id.
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    /// Event id.
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Table the change happened on.
    pub fn table(&self) -> &TableIdentity {
        &self.table
    }

    /// Trigger that produced the event.
    pub fn trigger(&self) -> &TriggerIdentity {
        &self.trigger
    }

    /// Operation.
    pub fn op(&self) -> Operation {
        self.event.op
    }

    /// Row before the change.
    pub fn old(&self) -> Option<&Value> {
        self.event.data.old.as_ref()
    }

    /// Row after the change.
    pub fn new_row(&self) -> Option<&Value> {
        self.event.data.new.as_ref()
    }

    /// Trace correlation ids, if any.
    pub fn trace_context(&self) -> Option<&TraceContext> {
        self.event.trace_context.as_ref()
    }

    /// Serializes the request body for one attempt.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if a row snapshot cannot be encoded.
    pub fn to_body(&self, delivery_info: Option<DeliveryInfo>) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&WirePayload { event: self, delivery_info })?)
    }
}

/// Destination for one delivery: URL, headers and timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookTarget {
    /// Sink URL.
    pub url: String,
    /// Caller-supplied headers.
    pub headers: WebhookHeaders,
    /// Upper bound on one attempt, in seconds.
    pub timeout_seconds: u32,
}

impl WebhookTarget {
    /// Creates a target.
    pub fn new(url: impl Into<String>, headers: WebhookHeaders, timeout_seconds: u32) -> Self {
        Self { url: url.into(), headers, timeout_seconds }
    }

    /// Timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_seconds))
    }
}

/// How a binding's URL and headers are obtained at delivery time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSource {
    /// URL and headers supplied at configuration time.
    Inline {
        /// Sink URL.
        url: String,
        /// Caller-supplied headers.
        headers: WebhookHeaders,
    },
    /// URL and headers looked up in the credential store per delivery.
    Stored,
}

impl TargetSource {
    /// Security mode this source corresponds to.
    pub fn security_mode(&self) -> SecurityMode {
        match self {
            Self::Inline { .. } => SecurityMode::None,
            Self::Stored => SecurityMode::Private,
        }
    }
}

/// Protected URL and headers for a PRIVATE binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    /// Binding the credentials belong to.
    pub key: TriggerKey,
    /// Sink URL.
    pub url: String,
    /// Caller-supplied headers.
    pub headers: WebhookHeaders,
    /// Last time the record was written.
    pub updated_at: DateTime<Utc>,
}

/// Declarative description of which row changes go where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerBinding {
    /// Table and trigger name.
    pub key: TriggerKey,
    /// Operations this binding reacts to; never empty.
    pub operations: Vec<Operation>,
    /// Timing this binding fires at.
    pub timing: TriggerTiming,
    /// Columns whose change lets an UPDATE through. `None` lets every
    /// UPDATE through; an empty list lets none through.
    pub update_columns: Option<Vec<String>>,
    /// Where URL and headers come from.
    pub source: TargetSource,
    /// Per-attempt timeout in seconds.
    pub timeout_seconds: u32,
    /// Whether exhausted SYNC delivery aborts the producing unit of work.
    pub cancel_on_failure: bool,
    /// Attempt budget and spacing.
    pub retry_policy: RetryPolicy,
    /// Inline or queued delivery.
    pub dispatch: DispatchMode,
}

impl TriggerBinding {
    /// Whether this binding reacts to `op` at `timing`.
    pub fn fires_on(&self, op: Operation, timing: TriggerTiming) -> bool {
        self.timing == timing && self.operations.contains(&op)
    }

    /// Payload trigger identity for events produced by this binding.
    pub fn trigger_identity(&self) -> TriggerIdentity {
        TriggerIdentity::new(self.key.trigger_name.clone(), Some(self.timing))
    }

    /// Security mode implied by the binding's target source.
    pub fn security(&self) -> SecurityMode {
        self.source.security_mode()
    }
}
