//! Protected store of URLs and headers for PRIVATE bindings.
//!
//! The table has all privileges revoked from `PUBLIC`; only the service role
//! reads it. Lookups happen per delivery so the latest write always wins.

use std::sync::Arc;

use sqlx::{postgres::PgRow, Executor, PgPool, Postgres, Row, Transaction};

use super::codec::{decode_headers, encode_headers};
use crate::{
    error::Result,
    models::{CredentialRecord, TableIdentity, TriggerKey},
};

/// Repository for credential records.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Writes credentials for `record.key`, replacing any previous ones.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn upsert(&self, record: &CredentialRecord) -> Result<()> {
        self.upsert_impl(&*self.pool, record).await
    }

    /// Writes credentials inside an existing transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn upsert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &CredentialRecord,
    ) -> Result<()> {
        self.upsert_impl(&mut **tx, record).await
    }

    async fn upsert_impl<'e, E>(&self, executor: E, record: &CredentialRecord) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO cdc_webhook.credentials (
                trigger_schema, trigger_table, trigger_name, webhook_url, headers, updated_at
            ) VALUES ($1, $2, $3, $4, $5::json, $6)
            ON CONFLICT (trigger_schema, trigger_table, trigger_name) DO UPDATE
            SET webhook_url = EXCLUDED.webhook_url,
                headers = EXCLUDED.headers,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.key.table.schema)
        .bind(&record.key.table.name)
        .bind(&record.key.trigger_name)
        .bind(&record.url)
        .bind(encode_headers(&record.headers)?)
        .bind(record.updated_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Looks up credentials for a binding.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, key: &TriggerKey) -> Result<Option<CredentialRecord>> {
        let row = sqlx::query(
            r#"
            SELECT trigger_schema, trigger_table, trigger_name, webhook_url,
                   headers::text AS headers, updated_at
            FROM cdc_webhook.credentials
            WHERE trigger_schema = $1 AND trigger_table = $2 AND trigger_name = $3
            "#,
        )
        .bind(&key.table.schema)
        .bind(&key.table.name)
        .bind(&key.trigger_name)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(credential_from_row).transpose()
    }

    /// Deletes credentials for a binding. Returns whether a row existed.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete(&self, key: &TriggerKey) -> Result<bool> {
        self.delete_impl(&*self.pool, key).await
    }

    /// Deletes credentials inside an existing transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &TriggerKey,
    ) -> Result<bool> {
        self.delete_impl(&mut **tx, key).await
    }

    async fn delete_impl<'e, E>(&self, executor: E, key: &TriggerKey) -> Result<bool>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            r#"
            DELETE FROM cdc_webhook.credentials
            WHERE trigger_schema = $1 AND trigger_table = $2 AND trigger_name = $3
            "#,
        )
        .bind(&key.table.schema)
        .bind(&key.table.name)
        .bind(&key.trigger_name)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn credential_from_row(row: &PgRow) -> Result<CredentialRecord> {
    let schema: String = row.try_get("trigger_schema")?;
    let table: String = row.try_get("trigger_table")?;
    let trigger_name: String = row.try_get("trigger_name")?;
    let headers: Option<String> = row.try_get("headers")?;

    Ok(CredentialRecord {
        key: TriggerKey::new(TableIdentity::new(schema, table), trigger_name),
        url: row.try_get("webhook_url")?,
        headers: decode_headers(headers.as_deref())?,
        updated_at: row.try_get("updated_at")?,
    })
}
