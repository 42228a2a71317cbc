//! Conversions between domain types and column values.

use sqlx::{postgres::PgRow, Row};

use crate::{
    error::{CoreError, Result},
    headers::WebhookHeaders,
    models::{SecurityMode, TableIdentity, TargetSource, TriggerKey},
    retry::{Backoff, RetryPolicy},
};

/// Column values describing where a target comes from.
pub(crate) struct SourceColumns {
    pub security: &'static str,
    pub url: Option<String>,
    pub headers: Option<String>,
}

pub(crate) fn encode_source(source: &TargetSource) -> Result<SourceColumns> {
    Ok(match source {
        TargetSource::Inline { url, headers } => SourceColumns {
            security: "NONE",
            url: Some(url.clone()),
            headers: Some(encode_headers(headers)?),
        },
        TargetSource::Stored => SourceColumns { security: "PRIVATE", url: None, headers: None },
    })
}

pub(crate) fn decode_source(row: &PgRow) -> Result<TargetSource> {
    let security: String = row.try_get("security")?;
    match security.parse::<SecurityMode>()? {
        SecurityMode::None => {
            let url: Option<String> = row.try_get("url")?;
            let headers: Option<String> = row.try_get("headers")?;
            Ok(TargetSource::Inline {
                url: url.ok_or_else(|| {
                    CoreError::Serialization("inline target stored without url".to_string())
                })?,
                headers: decode_headers(headers.as_deref())?,
            })
        },
        SecurityMode::Private => Ok(TargetSource::Stored),
    }
}

pub(crate) fn encode_headers(headers: &WebhookHeaders) -> Result<String> {
    Ok(serde_json::to_string(headers)?)
}

pub(crate) fn decode_headers(text: Option<&str>) -> Result<WebhookHeaders> {
    match text {
        Some(text) => Ok(WebhookHeaders::from_json_str(text)?),
        None => Ok(WebhookHeaders::new()),
    }
}

pub(crate) fn decode_policy(row: &PgRow) -> Result<RetryPolicy> {
    let max_retries = to_u32("max_retries", row.try_get("max_retries")?)?;
    let interval = to_u32("retry_interval", row.try_get("retry_interval")?)?;
    let backoff: String = row.try_get("retry_backoff")?;
    RetryPolicy::new(max_retries, interval, backoff.parse::<Backoff>()?)
}

pub(crate) fn decode_key(row: &PgRow, schema_col: &str, table_col: &str) -> Result<TriggerKey> {
    let schema: String = row.try_get(schema_col)?;
    let table: String = row.try_get(table_col)?;
    let trigger_name: String = row.try_get("trigger_name")?;
    Ok(TriggerKey::new(TableIdentity::new(schema, table), trigger_name))
}

pub(crate) fn to_u32(column: &str, value: i32) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| CoreError::Serialization(format!("{column} holds negative value {value}")))
}

pub(crate) fn to_i32(column: &str, value: u32) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| CoreError::invalid_input(format!("{column} value {value} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_columns_reject_values_outside_i32() {
        assert_eq!(to_i32("max_retries", i32::MAX as u32).unwrap(), i32::MAX);
        assert!(matches!(
            to_i32("max_retries", i32::MAX as u32 + 1),
            Err(CoreError::InvalidInput(message)) if message.contains("max_retries")
        ));
        assert!(to_u32("attempt_count", -1).is_err());
    }
}
