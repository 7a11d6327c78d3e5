//! Worker pool: claim due tasks and run them with bounded concurrency.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::repositories::TaskStore;
use crate::domain::Task;

/// Runs one claimed task to its next value.
#[async_trait]
pub trait TaskExecutor<T: Task>: Send + Sync {
    async fn execute(&self, task: &T) -> T;
}

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent executions.
    pub max_workers: usize,
    /// Delay between claim attempts when idle, in milliseconds.
    pub claim_interval_ms: u64,
    /// How long `shutdown` waits for running executions, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            claim_interval_ms: 5_000,
            shutdown_timeout_secs: 60,
        }
    }
}

/// Holds a worker slot for one execution. Releases it on drop, including
/// when the executor panics.
struct ActiveSlot {
    active: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl ActiveSlot {
    fn new(active: Arc<AtomicUsize>, permit: OwnedSemaphorePermit) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            active,
            _permit: permit,
        }
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Claim loop plus bounded executor set for one task kind.
pub struct WorkerPool {
    name: &'static str,
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &'static str) -> Self {
        Self::with_config(name, WorkerPoolConfig::default())
    }

    pub fn with_config(name: &'static str, config: WorkerPoolConfig) -> Self {
        let max_workers = config.max_workers.max(1);
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            config,
            active: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            handle: parking_lot::Mutex::new(None),
        }
    }

    /// Start the claim loop. Calling `start` on a running pool does nothing.
    pub fn start<T: Task>(
        &self,
        store: Arc<dyn TaskStore<T>>,
        executor: Arc<dyn TaskExecutor<T>>,
    ) {
        let mut handle = self.handle.lock();
        if handle.is_some() || self.cancellation_token.is_cancelled() {
            warn!("{} worker pool already started", self.name);
            return;
        }

        info!(
            "Starting {} worker pool with {} max workers",
            self.name, self.config.max_workers
        );

        let name = self.name;
        let semaphore = self.semaphore.clone();
        let active = self.active.clone();
        let token = self.cancellation_token.clone();
        let claim_interval = Duration::from_millis(self.config.claim_interval_ms);

        *handle = Some(tokio::spawn(async move {
            let mut running: JoinSet<()> = JoinSet::new();

            loop {
                while let Some(result) = running.try_join_next() {
                    if let Err(e) = result {
                        error!("{} task panicked: {}", name, e);
                    }
                }

                // Claim while permits remain and tasks are due.
                loop {
                    if token.is_cancelled() {
                        break;
                    }
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };

                    let task = match store.claim_queued().await {
                        Ok(Some(task)) => task,
                        Ok(None) => break,
                        Err(e) => {
                            error!("{} worker pool failed to claim task: {}", name, e);
                            break;
                        }
                    };

                    let executor = executor.clone();
                    let slot = ActiveSlot::new(active.clone(), permit);
                    running.spawn(async move {
                        let _slot = slot;
                        let id = task.id();
                        debug!("{} task {} started", name, id);
                        let result = executor.execute(&task).await;
                        debug!("{} task {} finished in state {}", name, id, result.state());
                    });
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(claim_interval) => {}
                }
            }

            debug!("{} claim loop stopped; waiting for {} running tasks", name, running.len());
            while let Some(result) = running.join_next().await {
                if let Err(e) = result {
                    error!("{} task panicked: {}", name, e);
                }
            }
        }));
    }

    /// Stop claiming and wait up to the configured timeout for running tasks.
    pub async fn shutdown(&self) {
        self.shutdown_with_timeout(Duration::from_secs(self.config.shutdown_timeout_secs))
            .await
    }

    pub async fn shutdown_with_timeout(&self, timeout: Duration) {
        info!("Stopping {} worker pool", self.name);
        self.cancellation_token.cancel();

        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return;
        };

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => info!("{} worker pool stopped", self.name),
            Ok(Err(e)) => error!("{} worker pool loop failed: {}", self.name, e),
            Err(_) => warn!(
                "{} worker pool shutdown timed out after {:?} with {} tasks still running",
                self.name,
                timeout,
                self.active_count()
            ),
        }
    }

    /// Number of executions currently in flight.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}
