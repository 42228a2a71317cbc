//! Idempotent installation of the `cdc_webhook` schema.
//!
//! Header documents are stored as `json` rather than `jsonb` so key order
//! survives the round trip.

use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;

const STATEMENTS: &[(&str, &str)] = &[
    ("schema", "CREATE SCHEMA IF NOT EXISTS cdc_webhook"),
    (
        "event_queue table",
        r#"
        CREATE TABLE IF NOT EXISTS cdc_webhook.event_queue (
            id UUID PRIMARY KEY,
            trigger_schema TEXT NOT NULL,
            trigger_table TEXT NOT NULL,
            trigger_name TEXT NOT NULL,
            security TEXT NOT NULL CHECK (security IN ('NONE', 'PRIVATE')),
            url TEXT,
            headers JSON,
            payload JSONB NOT NULL,
            timeout_seconds INTEGER NOT NULL CHECK (timeout_seconds > 0),
            status TEXT NOT NULL
                CHECK (status IN ('PENDING', 'IN_PROGRESS', 'DELIVERED', 'FAILED')),
            attempt_count INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
            attempt_times TIMESTAMPTZ[] NOT NULL DEFAULT '{}',
            attempt_statuses INTEGER[] NOT NULL DEFAULT '{}',
            attempt_responses TEXT[] NOT NULL DEFAULT '{}',
            next_attempt TIMESTAMPTZ,
            max_retries INTEGER NOT NULL CHECK (max_retries >= 0),
            retry_interval INTEGER NOT NULL CHECK (retry_interval > 0),
            retry_backoff TEXT NOT NULL CHECK (retry_backoff IN ('LINEAR', 'EXPONENTIAL')),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CHECK ((next_attempt IS NULL) = (status IN ('DELIVERED', 'FAILED'))),
            CHECK (cardinality(attempt_times) = attempt_count),
            CHECK (cardinality(attempt_statuses) = attempt_count),
            CHECK (cardinality(attempt_responses) = attempt_count)
        )
        "#,
    ),
    (
        "event_queue status index",
        "CREATE INDEX IF NOT EXISTS idx_event_queue_status ON cdc_webhook.event_queue (status)",
    ),
    (
        "event_queue next_attempt index",
        "CREATE INDEX IF NOT EXISTS idx_event_queue_next_attempt \
         ON cdc_webhook.event_queue (next_attempt)",
    ),
    (
        "event_queue status/next_attempt index",
        "CREATE INDEX IF NOT EXISTS idx_event_queue_status_next_attempt \
         ON cdc_webhook.event_queue (status, next_attempt)",
    ),
    (
        "credentials table",
        r#"
        CREATE TABLE IF NOT EXISTS cdc_webhook.credentials (
            trigger_schema TEXT NOT NULL,
            trigger_table TEXT NOT NULL,
            trigger_name TEXT NOT NULL,
            webhook_url TEXT NOT NULL,
            headers JSON NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (trigger_schema, trigger_table, trigger_name)
        )
        "#,
    ),
    ("credentials privileges", "REVOKE ALL ON cdc_webhook.credentials FROM PUBLIC"),
    (
        "trigger_bindings table",
        r#"
        CREATE TABLE IF NOT EXISTS cdc_webhook.trigger_bindings (
            table_schema TEXT NOT NULL,
            table_name TEXT NOT NULL,
            trigger_name TEXT NOT NULL,
            operations TEXT[] NOT NULL CHECK (cardinality(operations) > 0),
            timing TEXT NOT NULL CHECK (timing IN ('BEFORE', 'AFTER')),
            update_columns TEXT[],
            security TEXT NOT NULL CHECK (security IN ('NONE', 'PRIVATE')),
            url TEXT,
            headers JSON,
            timeout_seconds INTEGER NOT NULL CHECK (timeout_seconds > 0),
            cancel_on_failure BOOLEAN NOT NULL DEFAULT FALSE,
            max_retries INTEGER NOT NULL CHECK (max_retries >= 0),
            retry_interval INTEGER NOT NULL CHECK (retry_interval > 0),
            retry_backoff TEXT NOT NULL CHECK (retry_backoff IN ('LINEAR', 'EXPONENTIAL')),
            dispatch TEXT NOT NULL CHECK (dispatch IN ('SYNC', 'ASYNC')),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (table_schema, table_name, trigger_name),
            CHECK (NOT (dispatch = 'ASYNC' AND cancel_on_failure))
        )
        "#,
    ),
];

/// Runs every schema statement in order.
///
/// # Errors
///
/// Returns `CoreError::Database` if a statement fails.
pub async fn install(pool: &PgPool) -> Result<()> {
    for (name, statement) in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
        debug!(object = name, "schema object ensured");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_indexes_cover_claim_columns() {
        let indexes: Vec<&str> = STATEMENTS
            .iter()
            .filter(|(_, sql)| sql.contains("CREATE INDEX"))
            .map(|(_, sql)| *sql)
            .collect();

        assert!(indexes.iter().any(|sql| sql.contains("(status)")));
        assert!(indexes.iter().any(|sql| sql.contains("(next_attempt)")));
        assert!(indexes.iter().any(|sql| sql.contains("(status, next_attempt)")));
    }

    #[test]
    fn every_statement_is_idempotent() {
        for (name, sql) in STATEMENTS {
            assert!(
                sql.contains("IF NOT EXISTS") || sql.starts_with("REVOKE"),
                "{name} is not idempotent"
            );
        }
    }
}
