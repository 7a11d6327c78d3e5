//! Task execution engine.
//!
//! Executors take a claimed task and return its next value. They never return
//! an error: every failure is classified into a [`TaskError`] and applied to the
//! task, the store and the event sink by [`conclude`].

pub mod poll;
pub mod rake;
pub mod worker_pool;

pub use poll::PollExecutor;
pub use rake::RakeExecutor;
pub use worker_pool::{TaskExecutor, WorkerPool, WorkerPoolConfig};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{error, warn};

use crate::database::repositories::{StreamConfigDao, TaskStore};
use crate::domain::{DatumDao, Task, TaskState};
use crate::events::{
    ERROR_TAG, EventSink, INTEGRATION_TAG, RETRY_TAG, SECURITY_TAG, UserEvent, WARNING_TAG,
};
use crate::vendor::{DEFAULT_MAX_QUERY_PAGES, VendorError, VendorRegistry};

/// Delay before a transiently failed task runs again.
pub const RETRY_DELAY_SECS: i64 = 60;

/// Failure taxonomy for a task execution.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Stream configuration deleted while the task was in flight.
    #[error("datum stream configuration not found")]
    ConfigGone,

    #[error("schedule not usable")]
    ScheduleUnusable,

    #[error("service not available")]
    ServiceUnavailable,

    #[error("datum stream not fully configured")]
    NotFullyConfigured,

    #[error("datum stream has no service properties")]
    NoProperties,

    /// Rake offsets count whole calendar days back from today.
    #[error("rake offset {0} is not a non-negative whole number of days")]
    InvalidOffset(chrono::Duration),

    #[error("{0}")]
    AuthorizationDenied(String),

    #[error("{0}")]
    TransientRemote(VendorError),

    /// The stored task was not in the expected state.
    #[error("task state changed concurrently")]
    StateConflict,

    #[error("{0}")]
    Fatal(VendorError),
}

impl TaskError {
    /// Split a vendor or storage failure into retryable and terminal.
    pub fn classify(err: VendorError) -> Self {
        if err.is_transient() {
            Self::TransientRemote(err)
        } else {
            Self::Fatal(err)
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Self::ConfigGone | Self::TransientRemote(_) | Self::StateConflict
        )
    }
}

impl From<VendorError> for TaskError {
    fn from(err: VendorError) -> Self {
        Self::classify(err)
    }
}

impl From<crate::Error> for TaskError {
    fn from(err: crate::Error) -> Self {
        Self::classify(VendorError::Storage(err))
    }
}

/// Collaborators shared by the poll and rake executors.
#[derive(Clone)]
pub struct EngineContext {
    pub configs: Arc<dyn StreamConfigDao>,
    pub datum: Arc<dyn DatumDao>,
    pub events: Arc<dyn EventSink>,
    pub vendors: Arc<VendorRegistry>,
    pub max_query_pages: usize,
}

impl EngineContext {
    pub fn new(
        configs: Arc<dyn StreamConfigDao>,
        datum: Arc<dyn DatumDao>,
        events: Arc<dyn EventSink>,
        vendors: Arc<VendorRegistry>,
    ) -> Self {
        Self {
            configs,
            datum,
            events,
            vendors,
            max_query_pages: DEFAULT_MAX_QUERY_PAGES,
        }
    }

    pub fn with_max_query_pages(mut self, max_query_pages: usize) -> Self {
        self.max_query_pages = max_query_pages.max(1);
        self
    }
}

/// Execution time for a retry: `now + 1 minute` unless `execute_at` is already later.
pub fn retry_at(execute_at: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let earliest = now + Duration::seconds(RETRY_DELAY_SECS);
    if execute_at < earliest { earliest } else { execute_at }
}

/// Apply `err` to `task`, persisting the outcome with a CAS on `expected`.
///
/// Returns the task as the engine left it; a lost CAS still returns the new value.
pub(crate) async fn conclude<T: Task>(
    store: &dyn TaskStore<T>,
    events: &dyn EventSink,
    task: &T,
    expected: TaskState,
    err: TaskError,
) -> T {
    let id = task.id();
    match &err {
        TaskError::ConfigGone => return task.clone(),
        TaskError::StateConflict => {
            warn!(kind = T::KIND, stream = %id, "Task state changed concurrently; result discarded");
            return task.clone();
        }
        _ => {}
    }

    let message = err.to_string();
    let next = match &err {
        TaskError::TransientRemote(_) => {
            warn!(kind = T::KIND, stream = %id, error = %message, "Transient failure; task re-queued");
            task.with_outcome(
                TaskState::Queued,
                retry_at(task.execute_at(), Utc::now()),
                Some(message.clone()),
            )
        }
        _ => {
            error!(kind = T::KIND, stream = %id, error = %message, "Task stopped");
            task.with_outcome(TaskState::Completed, task.execute_at(), Some(message.clone()))
        }
    };

    let mut tags = vec![INTEGRATION_TAG, T::KIND];
    match &err {
        TaskError::TransientRemote(_) => tags.push(RETRY_TAG),
        TaskError::AuthorizationDenied(_) => tags.extend([ERROR_TAG, SECURITY_TAG]),
        _ => tags.push(ERROR_TAG),
    }
    events
        .add_event(
            UserEvent::for_stream(id, &tags, message)
                .with_data("executeAt", next.execute_at().to_rfc3339()),
        )
        .await;

    write_back(store, events, &next, expected).await;
    next
}

/// Persist `task` with a CAS on `expected`, logging and reporting a lost race.
pub(crate) async fn write_back<T: Task>(
    store: &dyn TaskStore<T>,
    events: &dyn EventSink,
    task: &T,
    expected: TaskState,
) -> bool {
    let id = task.id();
    match store.update(task, expected).await {
        Ok(true) => true,
        Ok(false) => {
            error!(
                kind = T::KIND,
                stream = %id,
                expected = %expected,
                "Failed to persist task: stored state changed"
            );
            events
                .add_event(UserEvent::for_stream(
                    id,
                    &[INTEGRATION_TAG, T::KIND, ERROR_TAG],
                    format!("Failed to update {} task state", T::KIND),
                ))
                .await;
            false
        }
        Err(e) => {
            error!(kind = T::KIND, stream = %id, error = %e, "Failed to persist task");
            false
        }
    }
}

/// CAS `Claimed -> Executing`; a lost race is logged and reported as a warning event.
pub(crate) async fn begin_execution<T: Task>(
    store: &dyn TaskStore<T>,
    events: &dyn EventSink,
    task: &T,
) -> Option<T> {
    let id = task.id();
    match store
        .update_state(id, TaskState::Executing, &[TaskState::Claimed])
        .await
    {
        Ok(true) => Some(task.with_state(TaskState::Executing)),
        Ok(false) => {
            warn!(kind = T::KIND, stream = %id, "Task no longer claimed; skipping execution");
            events
                .add_event(UserEvent::for_stream(
                    id,
                    &[INTEGRATION_TAG, T::KIND, WARNING_TAG],
                    format!("Unable to start {} task: state changed", T::KIND),
                ))
                .await;
            None
        }
        Err(e) => {
            error!(kind = T::KIND, stream = %id, error = %e, "Failed to mark task executing");
            None
        }
    }
}
