//! Change-event webhook delivery service.
//!
//! Installs the queue, credential and binding schema, applies the configured
//! trigger bindings, and runs the supervised dispatcher until terminated.
//! SIGHUP reloads configuration without restarting the dispatcher.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use cdc_webhook_capture::{BindingRegistry, BindingsFile, PostgresBindingStorage};
use cdc_webhook_core::{storage::Storage, RealClock};
use cdc_webhook_delivery::{
    CredentialResolver, DeliveryClient, DispatcherConfig, DispatcherWorker,
    PostgresCredentialStorage, PostgresQueueStorage, Supervisor,
};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, LogFormat};

const MAX_CONNECT_RETRIES: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(config.log_format)?;

    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        poll_interval_ms = config.poll_interval_ms,
        batch_size = config.batch_size,
        "configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    let storage = Arc::new(Storage::new(pool));
    storage.health_check().await.context("failed to verify database connection")?;
    storage.install_schema().await.context("failed to install schema")?;
    info!("schema installed");

    let clock = Arc::new(RealClock::new());
    let registry =
        BindingRegistry::new(Arc::new(PostgresBindingStorage::new(storage.clone())), clock.clone());
    apply_bindings(&registry, &config).await?;

    let client = DeliveryClient::new(config.to_client_config())
        .context("failed to build webhook client")?;
    let (config_tx, config_rx) = watch::channel(config.to_dispatcher_config());
    let worker = DispatcherWorker::new(
        Arc::new(PostgresQueueStorage::new(storage.clone())),
        CredentialResolver::new(Arc::new(PostgresCredentialStorage::new(storage.clone()))),
        client,
        clock,
        config_rx,
        CancellationToken::new(),
    );
    let supervisor = Supervisor::spawn(worker);
    info!("cdc-webhook dispatcher is running");

    wait_for_signals(&registry, &config_tx).await;
    info!("shutdown signal received, starting graceful shutdown");

    let shutdown_timeout = config_tx.borrow().shutdown_timeout;
    if let Err(e) = supervisor.shutdown_graceful(shutdown_timeout).await {
        error!(error = %e, "dispatcher did not shut down cleanly");
    }

    storage.pool().close().await;
    info!("cdc-webhook shutdown complete");
    Ok(())
}

/// Initializes tracing with `RUST_LOG` or the default filter.
fn init_tracing(format: LogFormat) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,cdc_webhook=debug"))
        .context("invalid RUST_LOG filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_current_span(true)).init(),
    }
    Ok(())
}

/// Connects to PostgreSQL, retrying while the database comes up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if retries < MAX_CONNECT_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_CONNECT_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Applies the configured bindings file, if any.
async fn apply_bindings(registry: &BindingRegistry, config: &Config) -> Result<()> {
    let Some(path) = &config.bindings_file else {
        return Ok(());
    };

    let file = BindingsFile::load(path)?;
    let applied = registry.apply_file(&file).await?;
    info!(path = %path.display(), bindings = applied, "trigger bindings applied");
    Ok(())
}

/// Re-reads configuration and bindings; an invalid result keeps the
/// previous settings in effect.
async fn reload(registry: &BindingRegistry, config_tx: &watch::Sender<DispatcherConfig>) {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %format!("{e:#}"), "configuration reload rejected");
            return;
        },
    };

    if let Err(e) = apply_bindings(registry, &config).await {
        error!(error = %format!("{e:#}"), "bindings reload rejected");
    }

    let dispatcher = config.to_dispatcher_config();
    config_tx.send_if_modified(|current| {
        let changed = *current != dispatcher;
        *current = dispatcher;
        changed
    });
    info!("configuration reloaded");
}

/// Serves SIGHUP reloads until CTRL+C or SIGTERM.
#[cfg(unix)]
async fn wait_for_signals(registry: &BindingRegistry, config_tx: &watch::Sender<DispatcherConfig>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut hangup, mut terminate) =
        match (signal(SignalKind::hangup()), signal(SignalKind::terminate())) {
            (Ok(hangup), Ok(terminate)) => (hangup, terminate),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "failed to install signal handlers, waiting for CTRL+C only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "failed to listen for CTRL+C");
                }
                return;
            },
        };

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("received SIGHUP signal");
                reload(registry, config_tx).await;
            },
            _ = terminate.recv() => {
                info!("received SIGTERM signal");
                return;
            },
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for CTRL+C");
                }
                info!("received CTRL+C signal");
                return;
            },
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_registry: &BindingRegistry, _config_tx: &watch::Sender<DispatcherConfig>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for CTRL+C");
    }
}
