//! Persisted event queue records and their delivery state machine.
//!
//! Status only moves along
//! `PENDING -> IN_PROGRESS -> {DELIVERED | PENDING | FAILED}`. The per-attempt
//! histories always have exactly `attempt_count` entries, `attempt_count`
//! never decreases, and `next_attempt` is null exactly when the record is
//! DELIVERED or FAILED. The storage layer applies outcomes through
//! [`EventQueueRecord::apply_outcome`] so these rules live in one place.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::{ChangeEvent, DeliveryInfo, TargetSource, TriggerKey},
    retry::RetryPolicy,
};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Identifier of a queued delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueRecordId(pub Uuid);

impl QueueRecordId {
    /// Creates a new random record ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueueRecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueueRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl sqlx::Type<PgDb> for QueueRecordId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for QueueRecordId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        Ok(Self(<Uuid as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for QueueRecordId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Delivery state of a queued record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    /// Waiting for `next_attempt` to pass.
    Pending,
    /// Claimed by the dispatcher worker.
    InProgress,
    /// Terminal success.
    Delivered,
    /// Terminal failure after exhausting the retry budget.
    Failed,
}

impl QueueStatus {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Delivered)
                | (Self::InProgress, Self::Pending)
                | (Self::InProgress, Self::Failed)
        )
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    /// Persisted spelling of the status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
        }
    }

    fn transition(self, next: Self) -> Result<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidTransition { from: self, to: next })
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "DELIVERED" => Ok(Self::Delivered),
            "FAILED" => Ok(Self::Failed),
            _ => Err(CoreError::invalid_input(format!("invalid queue status: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for QueueStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for QueueStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(|e: CoreError| e.to_string().into())
    }
}

impl sqlx::Encode<'_, PgDb> for QueueStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Classified result of one delivery attempt.
///
/// Never carries header values: the executor scrubs them from
/// `error_detail` and `response_snapshot` before building the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Whether the sink answered with a 2xx status.
    pub success: bool,
    /// Status code, when the sink answered at all.
    pub http_status: Option<u16>,
    /// Failure description; `None` on success.
    pub error_detail: Option<String>,
    /// Truncated response body or transport error text.
    pub response_snapshot: Option<String>,
}

impl DeliveryOutcome {
    /// Outcome for a response received from the sink.
    pub fn from_status(status: u16, response_snapshot: Option<String>) -> Self {
        let success = (200..300).contains(&status);
        Self {
            success,
            http_status: Some(status),
            error_detail: (!success).then(|| format!("HTTP {status}")),
            response_snapshot,
        }
    }

    /// Outcome for a transport-level failure (connect, DNS, timeout).
    pub fn transport(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            success: false,
            http_status: None,
            error_detail: Some(format!("transport error: {detail}")),
            response_snapshot: Some(detail),
        }
    }

    /// Outcome for an attempt that never reached the network.
    pub fn not_attempted(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            success: false,
            http_status: None,
            error_detail: Some(detail.clone()),
            response_snapshot: Some(detail),
        }
    }
}

/// Persisted unit of deferred delivery work.
#[derive(Debug, Clone, PartialEq)]
pub struct EventQueueRecord {
    /// Record id.
    pub id: QueueRecordId,
    /// Binding that produced the record.
    pub trigger: TriggerKey,
    /// Inline target or a pointer to stored credentials.
    pub source: TargetSource,
    /// Event to deliver.
    pub payload: ChangeEvent,
    /// Per-attempt timeout in seconds.
    pub timeout_seconds: u32,
    /// Current state.
    pub status: QueueStatus,
    /// Attempts made so far.
    pub attempt_count: u32,
    /// When each attempt finished.
    pub attempt_times: Vec<DateTime<Utc>>,
    /// Status code per attempt, `None` for transport failures.
    pub attempt_statuses: Vec<Option<u16>>,
    /// Response snapshot per attempt.
    pub attempt_responses: Vec<Option<String>>,
    /// When the record is next due; `None` once terminal.
    pub next_attempt: Option<DateTime<Utc>>,
    /// Attempt budget and spacing.
    pub retry_policy: RetryPolicy,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

impl EventQueueRecord {
    /// Creates a PENDING record due immediately.
    pub fn new(
        trigger: TriggerKey,
        source: TargetSource,
        payload: ChangeEvent,
        timeout_seconds: u32,
        retry_policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: QueueRecordId::new(),
            trigger,
            source,
            payload,
            timeout_seconds,
            status: QueueStatus::Pending,
            attempt_count: 0,
            attempt_times: Vec::new(),
            attempt_statuses: Vec::new(),
            attempt_responses: Vec::new(),
            next_attempt: Some(now),
            retry_policy,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the record may be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Pending && self.next_attempt.is_some_and(|due| due <= now)
    }

    /// Moves the record to IN_PROGRESS.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the record is PENDING.
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.status = self.status.transition(QueueStatus::InProgress)?;
        self.updated_at = now;
        Ok(())
    }

    /// Records the result of one attempt and decides what happens next.
    ///
    /// Every attempt, successful or not, is appended to the histories. A
    /// failure with budget left reschedules the record
    /// `delay(attempt_count - 1)` from `now`; a failure on the last allowed
    /// attempt marks it FAILED.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the record is
    /// IN_PROGRESS.
    pub fn apply_outcome(
        &mut self,
        outcome: &DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<QueueStatus> {
        let next = if outcome.success {
            QueueStatus::Delivered
        } else if self.attempt_count.saturating_add(1) < self.retry_policy.total_attempts() {
            QueueStatus::Pending
        } else {
            QueueStatus::Failed
        };
        self.status = self.status.transition(next)?;

        self.attempt_count = self.attempt_count.saturating_add(1);
        self.attempt_times.push(now);
        self.attempt_statuses.push(outcome.http_status);
        self.attempt_responses.push(outcome.response_snapshot.clone());

        self.next_attempt = match next {
            QueueStatus::Pending => {
                let delay = self.retry_policy.delay(self.attempt_count - 1);
                let due = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                Some(due)
            },
            _ => None,
        };
        self.updated_at = now;

        Ok(next)
    }

    /// Returns an abandoned IN_PROGRESS record to PENDING, due at `now`.
    ///
    /// Attempt counters and histories are left untouched.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the record is
    /// IN_PROGRESS.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.status = self.status.transition(QueueStatus::Pending)?;
        self.next_attempt = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Delivery info for the next attempt.
    pub fn delivery_info(&self) -> DeliveryInfo {
        DeliveryInfo {
            max_retries: self.retry_policy.max_retries(),
            current_retry: self.attempt_count,
        }
    }
}
