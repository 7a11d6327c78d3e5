//! Datum stream configuration.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity shared by a stream configuration and its poll/rake tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub user_id: i64,
    pub config_id: i64,
}

impl StreamId {
    pub fn new(user_id: i64, config_id: i64) -> Self {
        Self { user_id, config_id }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.config_id)
    }
}

/// The kind of object a datum stream belongs to.
///
/// This is a closed set: storage dispatches on it once, in [`crate::domain::Datum::persist`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum ObjectKind {
    #[strum(serialize = "n")]
    #[serde(rename = "n")]
    Node,
    #[strum(serialize = "l")]
    #[serde(rename = "l")]
    Location,
}

impl ObjectKind {
    pub fn as_key(&self) -> &'static str {
        match self {
            Self::Node => "n",
            Self::Location => "l",
        }
    }
}

/// Stream identity of a datum: `(kind, object_id, source_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub kind: ObjectKind,
    pub object_id: i64,
    pub source_id: String,
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.object_id, self.source_id)
    }
}

/// Configuration of a single cloud datum stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: StreamId,
    pub kind: ObjectKind,
    pub object_id: Option<i64>,
    pub source_id: Option<String>,
    /// Identifier of the vendor datum source servicing this stream.
    pub service_identifier: Option<String>,
    /// Schedule expression: a cron expression or a period in seconds.
    pub schedule: Option<String>,
    #[serde(default)]
    pub service_props: Map<String, Value>,
}

impl StreamConfig {
    /// True when every property the engine needs to query and store datum is present.
    pub fn is_fully_configured(&self) -> bool {
        self.object_id.is_some()
            && self
                .source_id
                .as_deref()
                .is_some_and(|s| !s.trim().is_empty())
            && self
                .service_identifier
                .as_deref()
                .is_some_and(|s| !s.trim().is_empty())
    }

    /// The datum stream key for this configuration, if fully configured.
    pub fn stream_key(&self) -> Option<StreamKey> {
        if !self.is_fully_configured() {
            return None;
        }
        Some(StreamKey {
            kind: self.kind,
            object_id: self.object_id?,
            source_id: self.source_id.clone()?,
        })
    }
}
