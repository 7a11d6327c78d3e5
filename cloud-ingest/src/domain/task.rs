//! Poll and rake task values.
//!
//! Tasks are plain values: executors receive a reference and return a new
//! task rather than mutating a shared instance.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::StreamId;
use crate::events::{POLL_TAG, RAKE_TAG};

/// Task lifecycle state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum TaskState {
    /// Waiting for `execute_at` to arrive.
    #[strum(serialize = "q")]
    #[serde(rename = "q")]
    Queued,
    /// Held exclusively by a worker, not yet running.
    #[strum(serialize = "c")]
    #[serde(rename = "c")]
    Claimed,
    /// Currently running.
    #[strum(serialize = "e")]
    #[serde(rename = "e")]
    Executing,
    /// Terminal; the task will not run again until reset externally.
    #[strum(serialize = "d")]
    #[serde(rename = "d")]
    Completed,
}

impl TaskState {
    pub fn as_key(&self) -> &'static str {
        match self {
            Self::Queued => "q",
            Self::Claimed => "c",
            Self::Executing => "e",
            Self::Completed => "d",
        }
    }
}

/// Shared accessors used by the task stores and worker pool.
pub trait Task: Clone + Send + Sync + 'static {
    /// Short label used in logs ("poll" / "rake").
    const KIND: &'static str;

    fn id(&self) -> StreamId;
    fn state(&self) -> TaskState;
    fn execute_at(&self) -> DateTime<Utc>;
    fn message(&self) -> Option<&str>;
    fn with_state(&self, state: TaskState) -> Self;

    /// Copy of this task with a new state, execution time and message.
    fn with_outcome(
        &self,
        state: TaskState,
        execute_at: DateTime<Utc>,
        message: Option<String>,
    ) -> Self;
}

/// Watermark-advancing ingestion task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollTask {
    pub id: StreamId,
    pub state: TaskState,
    pub execute_at: DateTime<Utc>,
    /// Ingestion watermark: the floor of the next query window.
    pub start_at: DateTime<Utc>,
    pub message: Option<String>,
    #[serde(default)]
    pub service_props: Map<String, Value>,
}

impl PollTask {
    pub fn new(id: StreamId, execute_at: DateTime<Utc>, start_at: DateTime<Utc>) -> Self {
        Self {
            id,
            state: TaskState::Queued,
            execute_at,
            start_at,
            message: None,
            service_props: Map::new(),
        }
    }
}

impl Task for PollTask {
    const KIND: &'static str = POLL_TAG;

    fn id(&self) -> StreamId {
        self.id
    }

    fn state(&self) -> TaskState {
        self.state
    }

    fn execute_at(&self) -> DateTime<Utc> {
        self.execute_at
    }

    fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    fn with_state(&self, state: TaskState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    fn with_outcome(
        &self,
        state: TaskState,
        execute_at: DateTime<Utc>,
        message: Option<String>,
    ) -> Self {
        Self {
            state,
            execute_at,
            message,
            ..self.clone()
        }
    }
}

/// Default rake offset: review yesterday.
pub const DEFAULT_RAKE_OFFSET_DAYS: i64 = 1;

/// Day-windowed reconciliation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RakeTask {
    pub id: StreamId,
    pub state: TaskState,
    pub execute_at: DateTime<Utc>,
    /// Subtracted from the start of "today" to pick the first day under review.
    #[serde(with = "offset_millis")]
    pub offset: Duration,
    pub message: Option<String>,
    #[serde(default)]
    pub service_props: Map<String, Value>,
}

impl RakeTask {
    pub fn new(id: StreamId, execute_at: DateTime<Utc>, offset: Duration) -> Self {
        Self {
            id,
            state: TaskState::Queued,
            execute_at,
            offset,
            message: None,
            service_props: Map::new(),
        }
    }

    /// Rake task reviewing the previous day.
    pub fn daily(id: StreamId, execute_at: DateTime<Utc>) -> Self {
        Self::new(id, execute_at, Duration::days(DEFAULT_RAKE_OFFSET_DAYS))
    }
}

impl Task for RakeTask {
    const KIND: &'static str = RAKE_TAG;

    fn id(&self) -> StreamId {
        self.id
    }

    fn state(&self) -> TaskState {
        self.state
    }

    fn execute_at(&self) -> DateTime<Utc> {
        self.execute_at
    }

    fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    fn with_state(&self, state: TaskState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    fn with_outcome(
        &self,
        state: TaskState,
        execute_at: DateTime<Utc>,
        message: Option<String>,
    ) -> Self {
        Self {
            state,
            execute_at,
            message,
            ..self.clone()
        }
    }
}

mod offset_millis {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(offset: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(offset.num_milliseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        i64::deserialize(deserializer).map(Duration::milliseconds)
    }
}
