//! Trigger configuration surface and its validation.
//!
//! A [`TriggerConfig`] mirrors what an operator supplies when attaching a
//! webhook to a table: loosely typed strings and signed integers, so that
//! out-of-range values can be reported instead of failing deserialization.
//! [`TriggerConfig::validate`] turns it into a [`TriggerBinding`] or rejects
//! it; nothing is persisted until validation has passed.

use std::{collections::HashSet, path::Path};

use cdc_webhook_core::{
    Backoff, CredentialRecord, DispatchMode, Operation, RetryPolicy, SecurityMode, TableIdentity,
    TargetSource, TriggerBinding, TriggerKey, TriggerTiming, WebhookHeaders,
};
use chrono::{DateTime, Utc};
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};

/// Largest count or duration the binding and queue columns can hold.
const MAX_STORED_VALUE: u32 = i32::MAX as u32;

/// Operator-facing description of one trigger binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerConfig {
    /// Trigger name, unique per table.
    pub name: String,
    /// Table the trigger is attached to.
    pub table_name: String,
    /// Schema of the table.
    #[serde(default = "default_schema_name")]
    pub schema_name: String,
    /// Operations to capture: any of INSERT, UPDATE, DELETE.
    pub operations: Vec<String>,
    /// Sink URL.
    pub webhook_url: String,
    /// Request headers. Non-string values are dropped.
    #[serde(default)]
    pub headers: WebhookHeaders,
    /// Columns whose change lets an UPDATE through; absent means all.
    #[serde(default)]
    pub update_columns: Option<Vec<String>>,
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: i64,
    /// Abort the producing change when SYNC delivery is exhausted.
    #[serde(default)]
    pub cancel_on_failure: bool,
    /// BEFORE or AFTER.
    #[serde(default = "default_trigger_timing")]
    pub trigger_timing: String,
    /// Retries after the first attempt.
    #[serde(default = "default_retry_number")]
    pub retry_number: i64,
    /// Base delay between attempts in seconds.
    #[serde(default = "default_retry_interval")]
    pub retry_interval: i64,
    /// LINEAR or EXPONENTIAL.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: String,
    /// NONE or PRIVATE.
    #[serde(default = "default_security")]
    pub security: String,
    /// SYNC or ASYNC.
    #[serde(default = "default_dispatch")]
    pub dispatch: String,
}

fn default_schema_name() -> String {
    "public".to_string()
}

fn default_timeout() -> i64 {
    5
}

fn default_trigger_timing() -> String {
    TriggerTiming::After.to_string()
}

fn default_retry_number() -> i64 {
    3
}

fn default_retry_interval() -> i64 {
    1
}

fn default_retry_backoff() -> String {
    Backoff::Linear.to_string()
}

fn default_security() -> String {
    SecurityMode::None.to_string()
}

fn default_dispatch() -> String {
    DispatchMode::Sync.to_string()
}

impl TriggerConfig {
    /// Configuration with every optional field at its default.
    pub fn new(
        name: impl Into<String>,
        table_name: impl Into<String>,
        operations: &[&str],
        webhook_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table_name: table_name.into(),
            schema_name: default_schema_name(),
            operations: operations.iter().map(|op| (*op).to_string()).collect(),
            webhook_url: webhook_url.into(),
            headers: WebhookHeaders::new(),
            update_columns: None,
            timeout: default_timeout(),
            cancel_on_failure: false,
            trigger_timing: default_trigger_timing(),
            retry_number: default_retry_number(),
            retry_interval: default_retry_interval(),
            retry_backoff: default_retry_backoff(),
            security: default_security(),
            dispatch: default_dispatch(),
        }
    }

    /// Key the binding is stored under.
    pub fn key(&self) -> TriggerKey {
        TriggerKey::new(TableIdentity::new(&self.schema_name, &self.table_name), &self.name)
    }

    /// Validates the configuration into a binding.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Configuration` naming the first invalid field.
    pub fn validate(&self) -> Result<TriggerBinding> {
        require_identifier("name", &self.name)?;
        require_identifier("table_name", &self.table_name)?;
        require_identifier("schema_name", &self.schema_name)?;

        if !(self.webhook_url.starts_with("http://") || self.webhook_url.starts_with("https://")) {
            return Err(CaptureError::configuration("webhook_url must be an http or https URL"));
        }

        let operations = parse_operations(&self.operations)?;
        let timing: TriggerTiming = self.trigger_timing.parse()?;

        let timeout_seconds = positive("timeout", self.timeout)?;
        let retry_interval = positive("retry_interval", self.retry_interval)?;
        let retry_number = match u32::try_from(self.retry_number) {
            Ok(v) if v <= MAX_STORED_VALUE => v,
            _ => {
                return Err(CaptureError::configuration(format!(
                    "retry_number must be between 0 and {MAX_STORED_VALUE}, got {}",
                    self.retry_number
                )))
            },
        };
        let backoff: Backoff = self.retry_backoff.parse()?;
        let retry_policy = RetryPolicy::new(retry_number, retry_interval, backoff)?;

        let security: SecurityMode = self.security.parse()?;
        let dispatch: DispatchMode = self.dispatch.parse()?;
        if dispatch == DispatchMode::Async && self.cancel_on_failure {
            return Err(CaptureError::configuration(
                "cancel_on_failure cannot be combined with ASYNC dispatch",
            ));
        }

        let source = match security {
            SecurityMode::None => {
                TargetSource::Inline { url: self.webhook_url.clone(), headers: self.headers.clone() }
            },
            SecurityMode::Private => TargetSource::Stored,
        };

        Ok(TriggerBinding {
            key: self.key(),
            operations,
            timing,
            update_columns: self.update_columns.clone(),
            source,
            timeout_seconds,
            cancel_on_failure: self.cancel_on_failure,
            retry_policy,
            dispatch,
        })
    }

    /// Credential record to store for a PRIVATE configuration.
    ///
    /// Returns `None` for NONE security or an unparseable security mode.
    pub fn credentials(&self, now: DateTime<Utc>) -> Option<CredentialRecord> {
        match self.security.parse::<SecurityMode>() {
            Ok(SecurityMode::Private) => Some(CredentialRecord {
                key: self.key(),
                url: self.webhook_url.clone(),
                headers: self.headers.clone(),
                updated_at: now,
            }),
            _ => None,
        }
    }
}

fn require_identifier(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CaptureError::configuration(format!("{field} must not be empty")));
    }
    Ok(())
}

fn positive(field: &str, value: i64) -> Result<u32> {
    match u32::try_from(value) {
        Ok(v) if (1..=MAX_STORED_VALUE).contains(&v) => Ok(v),
        _ => Err(CaptureError::configuration(format!(
            "{field} must be between 1 and {MAX_STORED_VALUE}, got {value}"
        ))),
    }
}

fn parse_operations(raw: &[String]) -> Result<Vec<Operation>> {
    if raw.is_empty() {
        return Err(CaptureError::configuration("operations must not be empty"));
    }

    let mut seen = HashSet::new();
    let mut operations = Vec::with_capacity(raw.len());
    for op in raw {
        let op: Operation = op.parse()?;
        if seen.insert(op) {
            operations.push(op);
        }
    }
    Ok(operations)
}

/// A TOML file of trigger configurations.
///
/// ```toml
/// [[triggers]]
/// name = "employee_changes"
/// table_name = "employees"
/// operations = ["INSERT", "UPDATE"]
/// webhook_url = "https://sink.example/hook"
/// headers = { "X-Api-Key" = "..." }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingsFile {
    /// Configured triggers.
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

impl BindingsFile {
    /// Loads a bindings file. A missing file yields no triggers.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Configuration` if the file cannot be parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .extract()
            .map_err(|e| CaptureError::configuration(format!("failed to load bindings file: {e}")))
    }

    /// Validates every trigger, failing on the first invalid one.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Configuration` naming the rejected trigger.
    pub fn validate(&self) -> Result<Vec<TriggerBinding>> {
        let mut keys = HashSet::new();
        self.triggers
            .iter()
            .map(|config| {
                if !keys.insert(config.key()) {
                    return Err(CaptureError::configuration(format!(
                        "trigger {} is configured twice",
                        config.key()
                    )));
                }
                config.validate().map_err(|e| match e {
                    CaptureError::Configuration { message } => CaptureError::configuration(
                        format!("trigger {}: {message}", config.key()),
                    ),
                    other => other,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn config() -> TriggerConfig {
        TriggerConfig::new("employee_insert", "employees", &["INSERT"], "http://sink.example/hook")
    }

    fn rejection(config: &TriggerConfig) -> String {
        match config.validate() {
            Err(CaptureError::Configuration { message }) => message,
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn defaults_produce_sync_inline_binding() {
        let binding = config().validate().unwrap();

        assert_eq!(binding.key.to_string(), "public.employees/employee_insert");
        assert_eq!(binding.timing, TriggerTiming::After);
        assert_eq!(binding.timeout_seconds, 5);
        assert_eq!(binding.retry_policy, RetryPolicy::new(3, 1, Backoff::Linear).unwrap());
        assert_eq!(binding.dispatch, DispatchMode::Sync);
        assert_eq!(binding.security(), SecurityMode::None);
        assert!(binding.update_columns.is_none());
    }

    #[test]
    fn empty_operations_are_rejected() {
        let config = TriggerConfig { operations: vec![], ..config() };
        assert_eq!(rejection(&config), "operations must not be empty");
    }

    #[test]
    fn unknown_timing_is_rejected() {
        let config = TriggerConfig { trigger_timing: "DURING".to_string(), ..config() };
        assert!(rejection(&config).contains("DURING"));
    }

    #[test]
    fn negative_retry_number_is_rejected() {
        let config = TriggerConfig { retry_number: -1, ..config() };
        assert!(rejection(&config).starts_with("retry_number"));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = TriggerConfig { retry_interval: 0, ..config() };
        assert_eq!(rejection(&config), "retry_interval must be between 1 and 2147483647, got 0");
    }

    #[test]
    fn values_beyond_column_range_are_rejected() {
        let limit = i64::from(i32::MAX);
        let accepted = TriggerConfig {
            retry_number: limit,
            retry_interval: limit,
            timeout: limit,
            ..config()
        }
        .validate()
        .unwrap();
        assert_eq!(accepted.retry_policy.max_retries(), i32::MAX as u32);
        assert_eq!(accepted.timeout_seconds, i32::MAX as u32);

        for config in [
            TriggerConfig { retry_number: limit + 1, ..config() },
            TriggerConfig { retry_interval: limit + 1, ..config() },
            TriggerConfig { timeout: limit + 1, ..config() },
            TriggerConfig { retry_number: i64::from(u32::MAX), ..config() },
        ] {
            assert!(rejection(&config).contains("2147483647"), "{config:?}");
        }
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = TriggerConfig { timeout: 0, ..config() };
        assert!(rejection(&config).starts_with("timeout"));
    }

    #[test]
    fn unknown_modes_are_rejected() {
        for config in [
            TriggerConfig { retry_backoff: "FIBONACCI".to_string(), ..config() },
            TriggerConfig { security: "SECRET".to_string(), ..config() },
            TriggerConfig { dispatch: "LATER".to_string(), ..config() },
            TriggerConfig { operations: vec!["TRUNCATE".to_string()], ..config() },
        ] {
            rejection(&config);
        }
    }

    #[test]
    fn async_with_cancel_on_failure_is_rejected() {
        let config =
            TriggerConfig { dispatch: "ASYNC".to_string(), cancel_on_failure: true, ..config() };
        assert_eq!(rejection(&config), "cancel_on_failure cannot be combined with ASYNC dispatch");
    }

    #[test]
    fn duplicate_operations_collapse() {
        let config = TriggerConfig {
            operations: vec!["insert".to_string(), "INSERT".to_string(), "delete".to_string()],
            ..config()
        };
        assert_eq!(config.validate().unwrap().operations, vec![Operation::Insert, Operation::Delete]);
    }

    #[test]
    fn private_binding_keeps_target_out_of_binding() {
        let config = TriggerConfig {
            security: "PRIVATE".to_string(),
            headers: [("Authorization", "secretvalue")].into_iter().collect(),
            ..config()
        };

        let binding = config.validate().unwrap();
        assert_eq!(binding.source, TargetSource::Stored);

        let credentials = config.credentials(Utc::now()).unwrap();
        assert_eq!(credentials.url, "http://sink.example/hook");
        assert_eq!(credentials.headers.get("Authorization"), Some("secretvalue"));
        assert!(!format!("{config:?}").contains("secretvalue"));
    }

    #[test]
    fn bindings_file_loads_and_validates() {
        let mut file = tempfile_path("bindings.toml");
        writeln!(
            file.1,
            r#"
            [[triggers]]
            name = "employee_changes"
            table_name = "employees"
            operations = ["INSERT", "UPDATE"]
            webhook_url = "https://sink.example/hook"
            update_columns = ["salary"]
            headers = {{ "X-Api-Key" = "abc", "X-Retries" = 3 }}

            [[triggers]]
            name = "employee_async"
            table_name = "employees"
            operations = ["DELETE"]
            webhook_url = "https://sink.example/hook"
            dispatch = "ASYNC"
            retry_backoff = "EXPONENTIAL"
            "#
        )
        .unwrap();

        let loaded = BindingsFile::load(&file.0).unwrap();
        let bindings = loaded.validate().unwrap();

        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].update_columns, Some(vec!["salary".to_string()]));
        assert_eq!(loaded.triggers[0].headers.names(), vec!["X-Api-Key"]);
        assert_eq!(bindings[1].dispatch, DispatchMode::Async);

        std::fs::remove_file(&file.0).unwrap();
    }

    #[test]
    fn malformed_headers_in_file_are_reported_without_their_value() {
        let mut file = tempfile_path("bad-headers.toml");
        writeln!(
            file.1,
            r#"
            [[triggers]]
            name = "employee_changes"
            table_name = "employees"
            operations = ["INSERT"]
            webhook_url = "https://sink.example/hook"
            headers = "Bearer s3cret"
            "#
        )
        .unwrap();

        let err = BindingsFile::load(&file.0).unwrap_err().to_string();
        std::fs::remove_file(&file.0).unwrap();

        assert!(err.contains("webhook_headers"), "{err}");
        assert!(!err.contains("s3cret"), "{err}");
    }

    #[test]
    fn duplicate_triggers_in_file_are_rejected() {
        let file = BindingsFile { triggers: vec![config(), config()] };
        assert!(matches!(file.validate(), Err(CaptureError::Configuration { .. })));
    }

    #[test]
    fn missing_bindings_file_is_empty() {
        let loaded = BindingsFile::load("/nonexistent/cdc-webhook-bindings.toml").unwrap();
        assert!(loaded.triggers.is_empty());
    }

    fn tempfile_path(name: &str) -> (std::path::PathBuf, std::fs::File) {
        let path = std::env::temp_dir()
            .join(format!("cdc-webhook-{}-{name}", std::process::id()));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
