//! Service container.
//!
//! Owns the SQLite-backed stores, the executors and their worker pools, the
//! token cache and the background maintenance loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::EngineConfig;
use crate::database::repositories::{
    SqlxDatumDao, SqlxEventSink, SqlxOwnershipResolver, SqlxPollTaskStore, SqlxRakeTaskStore,
    SqlxStreamConfigDao, TaskStore,
};
use crate::domain::{PollTask, RakeTask, Task};
use crate::engine::{EngineContext, PollExecutor, RakeExecutor, WorkerPool};
use crate::token::TokenLockManager;
use crate::vendor::VendorRegistry;

/// Counts from one abandoned-task sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbandonedReset {
    pub poll: u64,
    pub rake: u64,
}

/// Service container holding all engine services.
pub struct ServiceContainer {
    pub pool: SqlitePool,
    pub config: EngineConfig,
    pub poll_store: Arc<SqlxPollTaskStore>,
    pub rake_store: Arc<SqlxRakeTaskStore>,
    pub streams: Arc<SqlxStreamConfigDao>,
    pub datum: Arc<SqlxDatumDao>,
    pub ownership: Arc<SqlxOwnershipResolver>,
    pub events: Arc<SqlxEventSink>,
    pub vendors: Arc<VendorRegistry>,
    pub poll_executor: Arc<PollExecutor>,
    pub rake_executor: Arc<RakeExecutor>,
    tokens: Option<Arc<TokenLockManager>>,
    poll_pool: WorkerPool,
    rake_pool: WorkerPool,
    maintenance: parking_lot::Mutex<Option<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Wire the services over `pool`. Nothing runs until [`ServiceContainer::initialize`].
    pub fn new(pool: SqlitePool, config: EngineConfig, vendors: VendorRegistry) -> Self {
        let poll_store = Arc::new(SqlxPollTaskStore::new(pool.clone()));
        let rake_store = Arc::new(SqlxRakeTaskStore::new(pool.clone()));
        let streams = Arc::new(SqlxStreamConfigDao::new(pool.clone()));
        let datum = Arc::new(SqlxDatumDao::new(pool.clone()));
        let ownership = Arc::new(SqlxOwnershipResolver::new(pool.clone()));
        let events = Arc::new(SqlxEventSink::new(pool.clone()));
        let vendors = Arc::new(vendors);

        if vendors.is_empty() {
            warn!("No datum sources registered; every task will stop as service not available");
        }

        let ctx = EngineContext::new(
            streams.clone(),
            datum.clone(),
            events.clone(),
            vendors.clone(),
        )
        .with_max_query_pages(config.max_query_pages);

        let poll_executor = Arc::new(PollExecutor::new(ctx.clone(), poll_store.clone()));
        let rake_executor = Arc::new(RakeExecutor::new(
            ctx,
            rake_store.clone(),
            poll_store.clone(),
            ownership.clone(),
        ));

        let poll_pool = WorkerPool::with_config(PollTask::KIND, config.poll_pool());
        let rake_pool = WorkerPool::with_config(RakeTask::KIND, config.rake_pool());

        Self {
            pool,
            config,
            poll_store,
            rake_store,
            streams,
            datum,
            ownership,
            events,
            vendors,
            poll_executor,
            rake_executor,
            tokens: None,
            poll_pool,
            rake_pool,
            maintenance: parking_lot::Mutex::new(None),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Attach the token cache shared by the registered datum sources.
    ///
    /// Idle entries are pruned by the maintenance loop.
    pub fn with_token_manager(mut self, tokens: Arc<TokenLockManager>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Start both worker pools and the maintenance loop.
    pub fn initialize(&self) {
        info!(
            poll_workers = self.config.poll_workers,
            rake_workers = self.config.rake_workers,
            sources = self.vendors.len(),
            "Starting ingest services"
        );

        self.poll_pool
            .start::<PollTask>(self.poll_store.clone(), self.poll_executor.clone());
        self.rake_pool
            .start::<RakeTask>(self.rake_store.clone(), self.rake_executor.clone());
        self.start_maintenance();

        info!("Services initialized");
    }

    fn start_maintenance(&self) {
        let mut slot = self.maintenance.lock();
        if slot.is_some() {
            return;
        }

        let poll_store = self.poll_store.clone();
        let rake_store = self.rake_store.clone();
        let tokens = self.tokens.clone();
        let abandoned_age = self.config.abandoned_age;
        let interval = self.config.abandoned_check_interval;
        let cancellation_token = self.cancellation_token.clone();

        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Maintenance loop shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) =
                            reset_abandoned(poll_store.as_ref(), rake_store.as_ref(), abandoned_age).await
                        {
                            error!(error = %e, "Failed to reset abandoned tasks");
                        }
                        if let Some(tokens) = &tokens {
                            let pruned = tokens.prune_idle();
                            if pruned > 0 {
                                debug!(pruned, "Pruned idle token cache entries");
                            }
                        }
                    }
                }
            }
        }));
    }

    /// Run one abandoned-task sweep now.
    pub async fn reset_abandoned(&self) -> Result<AbandonedReset> {
        reset_abandoned(
            self.poll_store.as_ref(),
            self.rake_store.as_ref(),
            self.config.abandoned_age,
        )
        .await
    }

    /// Stop claiming, wait for running tasks and close the pool.
    pub async fn shutdown(&self) {
        info!(
            "Shutting down services (timeout: {:?})",
            self.config.shutdown_timeout
        );
        self.cancellation_token.cancel();

        tokio::join!(self.poll_pool.shutdown(), self.rake_pool.shutdown());

        let maintenance = self.maintenance.lock().take();
        if let Some(handle) = maintenance
            && let Err(e) = handle.await
        {
            warn!("Maintenance loop ended abnormally: {}", e);
        }

        info!("Closing database pool...");
        self.pool.close().await;
        info!("Services shut down");
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

async fn reset_abandoned(
    poll_store: &dyn TaskStore<PollTask>,
    rake_store: &dyn TaskStore<RakeTask>,
    age: Duration,
) -> Result<AbandonedReset> {
    let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::hours(1));
    let cutoff = Utc::now() - age;

    let counts = AbandonedReset {
        poll: poll_store.reset_abandoned(cutoff).await?,
        rake: rake_store.reset_abandoned(cutoff).await?,
    };
    if counts.poll > 0 || counts.rake > 0 {
        warn!(
            poll = counts.poll,
            rake = counts.rake,
            cutoff = %cutoff,
            "Reset abandoned tasks to queued"
        );
    }
    Ok(counts)
}
