//! User events.
//!
//! Every terminal, retry and success outcome of a task is recorded as a
//! structured event against the owning user. Emitting an event never fails
//! the caller: sinks log their own errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::domain::StreamId;

/// Tag attached to every event raised by this engine.
pub const INTEGRATION_TAG: &str = "c2c";
/// Tag for poll task events.
pub const POLL_TAG: &str = "poll";
/// Tag for rake task events.
pub const RAKE_TAG: &str = "rake";
pub const ERROR_TAG: &str = "error";
pub const WARNING_TAG: &str = "warning";
pub const SUCCESS_TAG: &str = "success";
/// Tag for events where the task will run again after a transient failure.
pub const RETRY_TAG: &str = "retry";
/// Tag for ownership / object mismatch events.
pub const SECURITY_TAG: &str = "security";

/// A structured event recorded against a user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    pub user_id: i64,
    pub tags: Vec<String>,
    pub message: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl UserEvent {
    pub fn new(user_id: i64, tags: &[&str], message: impl Into<String>) -> Self {
        Self {
            user_id,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            message: message.into(),
            data: Value::Object(Map::new()),
            created_at: Utc::now(),
        }
    }

    /// Event for a stream task, with the stream identity in the data map.
    pub fn for_stream(id: StreamId, tags: &[&str], message: impl Into<String>) -> Self {
        let mut event = Self::new(id.user_id, tags, message);
        event.insert("configId", Value::from(id.config_id));
        event
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    fn insert(&mut self, key: &str, value: Value) {
        if let Value::Object(map) = &mut self.data {
            map.insert(key.to_string(), value);
        }
    }
}

/// Destination for user events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn add_event(&self, event: UserEvent);
}

/// Event sink that only writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn add_event(&self, event: UserEvent) {
        let tags = event.tags.join(",");
        if event.has_tag(ERROR_TAG) {
            error!(user_id = event.user_id, %tags, data = %event.data, "{}", event.message);
        } else if event.has_tag(WARNING_TAG) || event.has_tag(RETRY_TAG) {
            warn!(user_id = event.user_id, %tags, data = %event.data, "{}", event.message);
        } else {
            info!(user_id = event.user_id, %tags, data = %event.data, "{}", event.message);
        }
    }
}
