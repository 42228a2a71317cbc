//! Throwaway PostgreSQL databases for repository tests.
//!
//! Each [`TestDatabase`] is a fresh database created through the server named
//! by `DATABASE_URL`, with the `cdc_webhook` schema already installed. Tests
//! that need one return early when `DATABASE_URL` is unset so the rest of the
//! suite runs without a server.

use anyhow::{Context, Result};
use cdc_webhook_core::storage::Storage;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Environment variable naming the server tests create databases on.
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";

/// An isolated database dropped by [`TestDatabase::cleanup`].
pub struct TestDatabase {
    storage: Storage,
    pool: PgPool,
    database_name: String,
    admin_pool: PgPool,
}

impl TestDatabase {
    /// Creates a database and installs the schema.
    ///
    /// Returns `Ok(None)` when `DATABASE_URL` is unset.
    ///
    /// # Errors
    ///
    /// Returns error if the server is unreachable or the schema fails to
    /// install.
    pub async fn create() -> Result<Option<Self>> {
        let Ok(url) = std::env::var(DATABASE_URL_VAR) else {
            warn!("{DATABASE_URL_VAR} not set, skipping database test");
            return Ok(None);
        };

        let admin_options: PgConnectOptions =
            url.parse().context("failed to parse DATABASE_URL")?;
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(admin_options.clone())
            .await
            .context("failed to connect to admin database")?;

        let database_name = format!("cdc_webhook_test_{}", Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE DATABASE \"{database_name}\""))
            .execute(&admin_pool)
            .await
            .with_context(|| format!("failed to create database {database_name}"))?;

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_with(admin_options.database(&database_name))
            .await
            .with_context(|| format!("failed to connect to database {database_name}"))?;

        let storage = Storage::new(pool.clone());
        storage.install_schema().await.context("failed to install schema")?;
        debug!(database = %database_name, "created test database");

        Ok(Some(Self { storage, pool, database_name, admin_pool }))
    }

    /// Repositories over the test database.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Direct pool access for assertions the repositories do not expose.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Name of the created database.
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Closes connections and drops the database.
    ///
    /// # Errors
    ///
    /// Returns error if the drop fails.
    pub async fn cleanup(self) -> Result<()> {
        self.pool.close().await;
        sqlx::query(&format!("DROP DATABASE IF EXISTS \"{}\"", self.database_name))
            .execute(&self.admin_pool)
            .await
            .with_context(|| format!("failed to drop database {}", self.database_name))?;
        self.admin_pool.close().await;
        Ok(())
    }
}
