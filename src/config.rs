//! Service configuration.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use cdc_webhook_delivery::{ClientConfig, DispatcherConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "cdc-webhook.toml";
const ENV_PREFIX: &str = "CDC_WEBHOOK_";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Complete service configuration.
///
/// Loaded in priority order:
/// 1. Environment variables prefixed `CDC_WEBHOOK_` (highest priority)
/// 2. Configuration file (`cdc-webhook.toml`)
/// 3. Built-in defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `CDC_WEBHOOK_DATABASE_URL`
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    #[serde(default = "default_min_connections")]
    pub database_min_connections: u32,
    /// Connection acquire timeout in seconds.
    #[serde(default = "default_connection_timeout")]
    pub database_connection_timeout: u64,

    // Dispatcher
    /// Pause between queue polls in milliseconds.
    ///
    /// Environment variable: `CDC_WEBHOOK_POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Most queue records claimed per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Age in seconds after which an IN_PROGRESS record is reclaimed.
    #[serde(default = "default_stale_after_seconds")]
    pub stale_after_seconds: u64,
    /// Pause before a failed worker is restarted, in milliseconds.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// How long shutdown waits for the worker, in seconds.
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,

    // Client
    /// User agent sent with webhook requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Redirects to follow; zero fails an attempt on any 3xx.
    #[serde(default)]
    pub max_redirects: u32,

    // Logging
    /// Log output format.
    ///
    /// Environment variable: `CDC_WEBHOOK_LOG_FORMAT`
    #[serde(default)]
    pub log_format: LogFormat,

    // Bindings
    /// TOML file of trigger configurations applied at start and on reload.
    #[serde(default)]
    pub bindings_file: Option<PathBuf>,
}

impl Config {
    /// Loads configuration from defaults, `cdc-webhook.toml` and environment
    /// variable overrides, then validates it.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX));

        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Dispatcher settings, sent to the worker on start and reload.
    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            batch_size: self.batch_size,
            stale_after: Duration::from_secs(self.stale_after_seconds),
            restart_delay: Duration::from_millis(self.restart_delay_ms),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    /// HTTP client settings.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig { user_agent: self.user_agent.clone(), max_redirects: self.max_redirects }
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                if !self.database_url[colon_pos + 1..].starts_with("//") {
                    let mut masked = self.database_url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return masked;
                }
            }
        }
        self.database_url.clone()
    }

    /// Rejects values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database_min_connections cannot exceed database_max_connections");
        }

        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than 0");
        }

        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }

        if self.shutdown_timeout_seconds == 0 {
            anyhow::bail!("shutdown_timeout_seconds must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_connection_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            stale_after_seconds: default_stale_after_seconds(),
            restart_delay_ms: default_restart_delay_ms(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
            user_agent: default_user_agent(),
            max_redirects: 0,
            log_format: LogFormat::default(),
            bindings_file: None,
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/cdc_webhook".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    cdc_webhook_delivery::DEFAULT_BATCH_SIZE
}

fn default_stale_after_seconds() -> u64 {
    300
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_shutdown_timeout_seconds() -> u64 {
    30
}

fn default_user_agent() -> String {
    ClientConfig::default().user_agent
}
