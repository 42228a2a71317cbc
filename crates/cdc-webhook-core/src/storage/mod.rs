//! PostgreSQL persistence for the event queue, credentials and bindings.
//!
//! Each table gets one repository holding a shared pool. Operations that a
//! caller may need inside its own transaction come in a plain and an
//! `_in_tx` flavour backed by one generic-executor helper.

use std::sync::Arc;

use sqlx::PgPool;

mod codec;

pub mod bindings;
pub mod credentials;
pub mod event_queue;
pub mod schema;

use crate::error::Result;

/// Container for all repositories sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Deferred delivery queue.
    pub event_queue: Arc<event_queue::Repository>,

    /// Protected credentials for PRIVATE bindings.
    pub credentials: Arc<credentials::Repository>,

    /// Declarative trigger bindings.
    pub bindings: Arc<bindings::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            event_queue: Arc::new(event_queue::Repository::new(pool.clone())),
            credentials: Arc::new(credentials::Repository::new(pool.clone())),
            bindings: Arc::new(bindings::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Shared pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Creates the `cdc_webhook` schema, tables and indexes if missing.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any statement fails.
    pub async fn install_schema(&self) -> Result<()> {
        schema::install(&self.pool).await
    }

    /// Verifies database connectivity with `SELECT 1`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}
