//! Webhook delivery for captured change events.
//!
//! Two paths share one HTTP executor:
//!
//! - **Synchronous** - [`SyncCoordinator`] runs every attempt of a sequence
//!   on the caller's task, sleeping between attempts, and turns exhaustion
//!   into either an abort or a warning.
//! - **Asynchronous** - [`DispatcherWorker`] polls the event queue, makes one
//!   attempt per due record and writes the outcome back. A [`Supervisor`]
//!   restarts it after unexpected exits.
//!
//! Destinations are resolved per delivery by [`CredentialResolver`], which
//! reads PRIVATE bindings' URL and headers from the credential store at send
//! time.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cdc_webhook_core::{RealClock, RetryPolicy, WebhookTarget};
//! use cdc_webhook_delivery::{DeliveryClient, DeliveryError, SyncCoordinator, SyncDelivery};
//!
//! # async fn example(event: cdc_webhook_core::ChangeEvent, target: WebhookTarget)
//! #     -> Result<(), DeliveryError> {
//! let coordinator = SyncCoordinator::new(DeliveryClient::with_defaults()?, Arc::new(RealClock));
//! let report = coordinator
//!     .deliver(SyncDelivery {
//!         event: &event,
//!         target: &target,
//!         retry_policy: RetryPolicy::default(),
//!         cancel_on_failure: false,
//!     })
//!     .await?;
//! if let Some(warning) = report.warning {
//!     eprintln!("{warning}");
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod storage;
pub mod supervisor;
pub mod worker;

pub use client::{AttemptRequest, ClientConfig, DeliveryClient, MAX_SNAPSHOT_BYTES};
pub use coordinator::{DeliveryReport, SyncCoordinator, SyncDelivery};
pub use credentials::{CredentialProvider, CredentialResolver, InlineCredentials, StoredCredentials};
pub use error::{DeliveryError, Result};
pub use storage::{CredentialStorage, PostgresCredentialStorage, PostgresQueueStorage, QueueStorage};
pub use supervisor::Supervisor;
pub use worker::{DispatcherConfig, DispatcherWorker};

/// Default number of queue records claimed per poll.
pub const DEFAULT_BATCH_SIZE: usize = 100;
