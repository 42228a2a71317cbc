//! Core domain models and storage for change-event webhook delivery.
//!
//! Provides the change-event document and its wire payload, typed webhook
//! headers, retry scheduling, the persisted event queue state machine, a
//! clock abstraction, and PostgreSQL repositories. Every other crate in the
//! workspace builds on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod headers;
pub mod models;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use headers::{WebhookHeaders, HEADERS_PLACEHOLDER};
pub use models::{
    ChangeEvent, CredentialRecord, DeliveryInfo, DispatchMode, EventId, Operation,
    SecurityMode, TableIdentity, TargetSource, TraceContext, TriggerBinding, TriggerIdentity,
    TriggerKey, TriggerTiming, WebhookTarget,
};
pub use queue::{DeliveryOutcome, EventQueueRecord, QueueRecordId, QueueStatus};
pub use retry::{Backoff, RetryPolicy};
pub use time::{Clock, RealClock, TestClock};
