//! Supervision of the single dispatcher worker.
//!
//! The supervisor task starts the worker, and whenever it exits without
//! having been cancelled, whether by returning an error or by panicking,
//! waits the configured restart delay and starts a fresh instance. Shutdown
//! cancels the shared token and waits for the supervisor task within a
//! bounded timeout.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    worker::DispatcherWorker,
};

/// Handle to a running, supervised dispatcher.
pub struct Supervisor {
    handle: Option<JoinHandle<()>>,
    cancellation_token: CancellationToken,
    restarts: Arc<AtomicU32>,
}

impl Supervisor {
    /// Starts supervising `worker` on the current runtime.
    ///
    /// The worker's own cancellation token stops both the worker and the
    /// supervision loop.
    pub fn spawn(worker: DispatcherWorker) -> Self {
        let cancellation_token = worker.cancellation_token().clone();
        let restarts = Arc::new(AtomicU32::new(0));

        let handle = tokio::spawn(supervise(worker, cancellation_token.clone(), restarts.clone()));
        info!("dispatcher supervisor started");

        Self { handle: Some(handle), cancellation_token, restarts }
    }

    /// Times the worker has been restarted after an unexpected exit.
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Acquire)
    }

    /// Whether the supervision loop is still alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Cancels the worker and waits for it to finish its current batch.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if the worker does not stop
    /// within `timeout`, or `DeliveryError::WorkerPanic` if the supervision
    /// task itself panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(timeout_seconds = timeout.as_secs(), "initiating dispatcher shutdown");
        self.cancellation_token.cancel();

        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => {
                info!(restarts = self.restarts(), "dispatcher shutdown completed");
                Ok(())
            },
            Ok(Err(join_error)) => {
                error!(error = %join_error, "dispatcher supervisor panicked during shutdown");
                Err(DeliveryError::WorkerPanic { error: join_error.to_string() })
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "dispatcher shutdown timed out, worker may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.is_running() && !self.cancellation_token.is_cancelled() {
            warn!("dispatcher supervisor dropped without shutdown, cancelling worker");
            self.cancellation_token.cancel();
        }
    }
}

async fn supervise(
    worker: DispatcherWorker,
    cancellation_token: CancellationToken,
    restarts: Arc<AtomicU32>,
) {
    let clock = worker.clock();

    loop {
        let mut instance = worker.clone();
        let exit = tokio::spawn(async move { instance.run().await }).await;

        if cancellation_token.is_cancelled() {
            if let Ok(Err(error)) = &exit {
                warn!(error = %error, "dispatcher worker completed with error during shutdown");
            }
            break;
        }

        match exit {
            Ok(Ok(())) => warn!("dispatcher worker exited unexpectedly"),
            Ok(Err(error)) => error!(error = %error, "dispatcher worker terminated with error"),
            Err(join_error) => error!(error = %join_error, "dispatcher worker panicked"),
        }

        let restart_delay = worker.current_config().restart_delay;
        tokio::select! {
            () = clock.sleep(restart_delay) => {}
            () = cancellation_token.cancelled() => break,
        }

        let count = restarts.fetch_add(1, Ordering::AcqRel) + 1;
        info!(restarts = count, "restarting dispatcher worker");
    }

    info!("dispatcher supervisor stopped");
}

#[cfg(test)]
mod tests {
    use cdc_webhook_core::TestClock;
    use tokio::sync::watch;

    use super::*;
    use crate::{
        client::DeliveryClient,
        credentials::CredentialResolver,
        storage::mock::{MockCredentialStorage, MockQueueStorage},
        worker::DispatcherConfig,
    };

    fn worker(queue: &MockQueueStorage, clock: &TestClock) -> DispatcherWorker {
        let (_config_tx, config_rx) = watch::channel(DispatcherConfig::default());
        DispatcherWorker::new(
            Arc::new(queue.clone()),
            CredentialResolver::new(Arc::new(MockCredentialStorage::new())),
            DeliveryClient::with_defaults().unwrap(),
            Arc::new(clock.clone()),
            config_rx,
            CancellationToken::new(),
        )
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn shutdown_stops_idle_worker() {
        let clock = TestClock::new();
        let supervisor = Supervisor::spawn(worker(&MockQueueStorage::new(), &clock));

        assert!(supervisor.is_running());
        supervisor.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn failed_worker_is_restarted_after_delay() {
        let clock = TestClock::new();
        let queue = MockQueueStorage::new();
        queue.inject_claim_error("connection reset").await;

        let supervisor = Supervisor::spawn(worker(&queue, &clock));
        wait_for(|| supervisor.restarts() >= 1).await;

        assert_eq!(supervisor.restarts(), 1);
        assert!(supervisor.is_running());
        assert!(clock.recorded_sleeps().contains(&Duration::from_secs(1)));

        supervisor.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn dropping_supervisor_cancels_worker() {
        let clock = TestClock::new();
        let worker = worker(&MockQueueStorage::new(), &clock);
        let token = worker.cancellation_token().clone();

        drop(Supervisor::spawn(worker));

        assert!(token.is_cancelled());
    }
}
