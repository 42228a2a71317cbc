//! Repository for the deferred delivery queue.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a transaction so the
//! `PENDING -> IN_PROGRESS` transition is atomic per record: a second
//! claimant skips rows the first one holds instead of waiting for them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Executor, PgPool, Postgres, Row};
use uuid::Uuid;

use super::codec::{decode_key, decode_policy, decode_source, encode_source, to_i32, to_u32};
use crate::{
    error::{CoreError, Result},
    models::ChangeEvent,
    queue::{DeliveryOutcome, EventQueueRecord, QueueRecordId, QueueStatus},
};

const RECORD_COLUMNS: &str = r#"
    id, trigger_schema, trigger_table, trigger_name, security, url,
    headers::text AS headers, payload, timeout_seconds, status, attempt_count,
    attempt_times, attempt_statuses, attempt_responses, next_attempt,
    max_retries, retry_interval, retry_backoff, created_at, updated_at
"#;

/// Repository for event queue records.
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

    /// Inserts a new PENDING record.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails or the record violates a constraint.
    pub async fn enqueue(&self, record: &EventQueueRecord) -> Result<QueueRecordId> {
        self.enqueue_impl(&*self.pool, record).await
    }

    async fn enqueue_impl<'e, E>(&self, executor: E, record: &EventQueueRecord) -> Result<QueueRecordId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        if record.status != QueueStatus::Pending || record.attempt_count != 0 {
            return Err(CoreError::invalid_input("only fresh PENDING records can be enqueued"));
        }

        let source = encode_source(&record.source)?;
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO cdc_webhook.event_queue (
                id, trigger_schema, trigger_table, trigger_name, security, url, headers,
                payload, timeout_seconds, status, attempt_count, next_attempt,
                max_retries, retry_interval, retry_backoff, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7::json, $8, $9, $10, 0, $11, $12, $13, $14, $15, $15
            )
            RETURNING id
            "#,
        )
        .bind(record.id)
        .bind(&record.trigger.table.schema)
        .bind(&record.trigger.table.name)
        .bind(&record.trigger.trigger_name)
        .bind(source.security)
        .bind(source.url)
        .bind(source.headers)
        .bind(sqlx::types::Json(&record.payload))
        .bind(to_i32("timeout_seconds", record.timeout_seconds)?)
        .bind(record.status)
        .bind(record.next_attempt)
        .bind(to_i32("max_retries", record.retry_policy.max_retries())?)
        .bind(to_i32("retry_interval", record.retry_policy.base_interval_seconds())?)
        .bind(record.retry_policy.backoff().to_string())
        .bind(record.created_at)
        .fetch_one(executor)
        .await?;

        Ok(QueueRecordId(id))
    }

    /// Claims PENDING records due at `now`, oldest `next_attempt` first.
    ///
    /// Each returned record has already been moved to IN_PROGRESS.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EventQueueRecord>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM cdc_webhook.event_queue
            WHERE status = 'PENDING'
              AND next_attempt <= $1
            ORDER BY next_attempt ASC, created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            UPDATE cdc_webhook.event_queue
            SET status = 'IN_PROGRESS', updated_at = $2
            WHERE id = ANY($1) AND status = 'PENDING'
            RETURNING {RECORD_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql).bind(&ids).bind(now).fetch_all(&mut *tx).await?;

        tx.commit().await?;

        let mut records = rows.iter().map(record_from_row).collect::<Result<Vec<_>>>()?;
        records.sort_by_key(|record| (record.next_attempt, record.created_at));
        Ok(records)
    }

    /// Applies the outcome of one attempt to an IN_PROGRESS record.
    ///
    /// The record is locked, run through
    /// [`EventQueueRecord::apply_outcome`], and written back in the same
    /// transaction. Returns the updated record.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for an unknown id and
    /// `CoreError::InvalidTransition` if the record is not IN_PROGRESS.
    pub async fn record_outcome(
        &self,
        id: QueueRecordId,
        outcome: &DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<EventQueueRecord> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {RECORD_COLUMNS} FROM cdc_webhook.event_queue WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("queue record {id}")))?;
        let mut record = record_from_row(&row)?;

        record.apply_outcome(outcome, now)?;

        let statuses: Vec<Option<i32>> =
            record.attempt_statuses.iter().map(|s| s.map(i32::from)).collect();
        sqlx::query(
            r#"
            UPDATE cdc_webhook.event_queue
            SET status = $2,
                attempt_count = $3,
                attempt_times = $4,
                attempt_statuses = $5,
                attempt_responses = $6,
                next_attempt = $7,
                updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(record.status)
        .bind(to_i32("attempt_count", record.attempt_count)?)
        .bind(&record.attempt_times)
        .bind(&statuses)
        .bind(&record.attempt_responses)
        .bind(record.next_attempt)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }

    /// Returns IN_PROGRESS records last touched before `stale_before` to
    /// PENDING, due at `now`. Returns how many were reclaimed.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reclaim_stale(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE cdc_webhook.event_queue
            SET status = 'PENDING', next_attempt = $1, updated_at = $1
            WHERE status = 'IN_PROGRESS' AND updated_at < $2
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Finds a record by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: QueueRecordId) -> Result<Option<EventQueueRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM cdc_webhook.event_queue WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&*self.pool).await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Counts records in `status`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_status(&self, status: QueueStatus) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM cdc_webhook.event_queue WHERE status = $1")
            .bind(status)
            .fetch_one(&*self.pool)
            .await?;
        Ok(count)
    }
}

fn record_from_row(row: &PgRow) -> Result<EventQueueRecord> {
    let payload: sqlx::types::Json<ChangeEvent> = row.try_get("payload")?;
    let statuses: Vec<Option<i32>> = row.try_get("attempt_statuses")?;

    Ok(EventQueueRecord {
        id: row.try_get("id")?,
        trigger: decode_key(row, "trigger_schema", "trigger_table")?,
        source: decode_source(row)?,
        payload: payload.0,
        timeout_seconds: to_u32("timeout_seconds", row.try_get("timeout_seconds")?)?,
        status: row.try_get("status")?,
        attempt_count: to_u32("attempt_count", row.try_get("attempt_count")?)?,
        attempt_times: row.try_get("attempt_times")?,
        attempt_statuses: statuses
            .into_iter()
            .map(|status| status.and_then(|s| u16::try_from(s).ok()))
            .collect(),
        attempt_responses: row.try_get("attempt_responses")?,
        next_attempt: row.try_get("next_attempt")?,
        retry_policy: decode_policy(row)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
