//! Test infrastructure for the cdc-webhook workspace.
//!
//! Provides a mock webhook sink, builders for change events and trigger
//! bindings, and throwaway PostgreSQL databases for repository tests.
//! Storage doubles live next to the traits they implement, in each crate's
//! `storage::mock` module.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod database;
pub mod fixtures;
pub mod http;

pub use cdc_webhook_core::TestClock;
pub use database::TestDatabase;
pub use fixtures::{employee_row, employees, fixed_time, BindingBuilder, ChangeEventBuilder};
pub use crate::http::{assertions, MockSink};
