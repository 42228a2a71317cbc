//! Declarative trigger bindings.
//!
//! A PRIVATE binding row carries no URL or headers; those live in the
//! credential store and are written alongside it in one transaction by the
//! registry.

use std::sync::Arc;

use sqlx::{postgres::PgRow, Executor, PgPool, Postgres, Row, Transaction};

use super::codec::{decode_key, decode_policy, decode_source, encode_source, to_i32, to_u32};
use crate::{
    error::Result,
    models::{DispatchMode, Operation, TableIdentity, TriggerBinding, TriggerKey, TriggerTiming},
};

const BINDING_COLUMNS: &str = r#"
    table_schema, table_name, trigger_name, operations, timing, update_columns,
    security, url, headers::text AS headers, timeout_seconds, cancel_on_failure,
    max_retries, retry_interval, retry_backoff, dispatch
"#;

/// Repository for trigger bindings.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Creates or replaces a binding.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn upsert(&self, binding: &TriggerBinding) -> Result<()> {
        self.upsert_impl(&*self.pool, binding).await
    }

    /// Creates or replaces a binding inside an existing transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn upsert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        binding: &TriggerBinding,
    ) -> Result<()> {
        self.upsert_impl(&mut **tx, binding).await
    }

    async fn upsert_impl<'e, E>(&self, executor: E, binding: &TriggerBinding) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let source = encode_source(&binding.source)?;
        let operations: Vec<String> = binding.operations.iter().map(ToString::to_string).collect();

        sqlx::query(
            r#"
            INSERT INTO cdc_webhook.trigger_bindings (
                table_schema, table_name, trigger_name, operations, timing, update_columns,
                security, url, headers, timeout_seconds, cancel_on_failure,
                max_retries, retry_interval, retry_backoff, dispatch
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9::json, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (table_schema, table_name, trigger_name) DO UPDATE
            SET operations = EXCLUDED.operations,
                timing = EXCLUDED.timing,
                update_columns = EXCLUDED.update_columns,
                security = EXCLUDED.security,
                url = EXCLUDED.url,
                headers = EXCLUDED.headers,
                timeout_seconds = EXCLUDED.timeout_seconds,
                cancel_on_failure = EXCLUDED.cancel_on_failure,
                max_retries = EXCLUDED.max_retries,
                retry_interval = EXCLUDED.retry_interval,
                retry_backoff = EXCLUDED.retry_backoff,
                dispatch = EXCLUDED.dispatch,
                updated_at = NOW()
            "#,
        )
        .bind(&binding.key.table.schema)
        .bind(&binding.key.table.name)
        .bind(&binding.key.trigger_name)
        .bind(&operations)
        .bind(binding.timing.to_string())
        .bind(&binding.update_columns)
        .bind(source.security)
        .bind(source.url)
        .bind(source.headers)
        .bind(to_i32("timeout_seconds", binding.timeout_seconds)?)
        .bind(binding.cancel_on_failure)
        .bind(to_i32("max_retries", binding.retry_policy.max_retries())?)
        .bind(to_i32("retry_interval", binding.retry_policy.base_interval_seconds())?)
        .bind(binding.retry_policy.backoff().to_string())
        .bind(binding.dispatch.to_string())
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Deletes a binding. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete(&self, key: &TriggerKey) -> Result<bool> {
        self.delete_impl(&*self.pool, key).await
    }

    /// Deletes a binding inside an existing transaction.
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
            DELETE FROM cdc_webhook.trigger_bindings
            WHERE table_schema = $1 AND table_name = $2 AND trigger_name = $3
            "#,
        )
        .bind(&key.table.schema)
        .bind(&key.table.name)
        .bind(&key.trigger_name)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Every binding, ordered by table then trigger name.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_all(&self) -> Result<Vec<TriggerBinding>> {
        let sql = format!(
            "SELECT {BINDING_COLUMNS} FROM cdc_webhook.trigger_bindings \
             ORDER BY table_schema, table_name, trigger_name"
        );
        let rows = sqlx::query(&sql).fetch_all(&*self.pool).await?;
        rows.iter().map(binding_from_row).collect()
    }

    /// Bindings attached to one table, ordered by trigger name.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_for_table(&self, table: &TableIdentity) -> Result<Vec<TriggerBinding>> {
        let sql = format!(
            "SELECT {BINDING_COLUMNS} FROM cdc_webhook.trigger_bindings \
             WHERE table_schema = $1 AND table_name = $2 ORDER BY trigger_name"
        );
        let rows = sqlx::query(&sql)
            .bind(&table.schema)
            .bind(&table.name)
            .fetch_all(&*self.pool)
            .await?;
        rows.iter().map(binding_from_row).collect()
    }
}

fn binding_from_row(row: &PgRow) -> Result<TriggerBinding> {
    let operations: Vec<String> = row.try_get("operations")?;
    let timing: String = row.try_get("timing")?;
    let dispatch: String = row.try_get("dispatch")?;

    Ok(TriggerBinding {
        key: decode_key(row, "table_schema", "table_name")?,
        operations: operations
            .iter()
            .map(|op| op.parse::<Operation>())
            .collect::<Result<Vec<_>>>()?,
        timing: timing.parse::<TriggerTiming>()?,
        update_columns: row.try_get("update_columns")?,
        source: decode_source(row)?,
        timeout_seconds: to_u32("timeout_seconds", row.try_get("timeout_seconds")?)?,
        cancel_on_failure: row.try_get("cancel_on_failure")?,
        retry_policy: decode_policy(row)?,
        dispatch: dispatch.parse::<DispatchMode>()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_columns_match_decoder() {
        for column in [
            "operations",
            "update_columns",
            "headers::text AS headers",
            "cancel_on_failure",
            "dispatch",
        ] {
            assert!(BINDING_COLUMNS.contains(column), "missing {column}");
        }
    }
}
