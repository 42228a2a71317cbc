//! Trigger bindings and the row-change capture routine.
//!
//! A [`BindingRegistry`] validates [`TriggerConfig`]s and stores them as
//! bindings. For every row change the producer calls
//! [`EventCapture::capture`], which evaluates the table's bindings, applies
//! the UPDATE column filter, and either delivers the event inline or places
//! it on the event queue for the dispatcher.
//!
//! A SYNC binding with `cancel_on_failure` that exhausts its attempts makes
//! `capture` return [`CaptureError::Aborted`]; the producer must roll back
//! the change.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod capture;
pub mod config;
pub mod error;
pub mod filter;
pub mod registry;
pub mod storage;

pub use capture::{CaptureReport, EventCapture, RowChange};
pub use config::{BindingsFile, TriggerConfig};
pub use error::{CaptureError, Result};
pub use filter::UpdateColumnFilter;
pub use registry::BindingRegistry;
pub use storage::{BindingStorage, PostgresBindingStorage};
