//! Datum values and sample comparison.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ObjectKind, StreamKey};
use crate::Result;

/// A single sample property value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Number(f64),
    Text(String),
}

impl SampleValue {
    /// Numbers compare by value, text compares exactly; a number never equals text.
    pub fn same_as(&self, other: &SampleValue) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::Text(a), Self::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialEq for SampleValue {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl From<f64> for SampleValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for SampleValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for SampleValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

pub type SampleMap = BTreeMap<String, SampleValue>;

/// Grouped sample properties of a datum.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatumSamples {
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    pub instantaneous: Option<SampleMap>,
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub accumulating: Option<SampleMap>,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SampleMap>,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
}

fn maps_differ(a: Option<&SampleMap>, b: Option<&SampleMap>) -> bool {
    // A missing map and an empty map are equivalent.
    let empty = SampleMap::new();
    let a = a.unwrap_or(&empty);
    let b = b.unwrap_or(&empty);
    if a.len() != b.len() {
        return true;
    }
    a.iter()
        .any(|(key, value)| b.get(key).is_none_or(|other| !value.same_as(other)))
}

impl DatumSamples {
    pub fn is_empty(&self) -> bool {
        self.instantaneous.as_ref().is_none_or(|m| m.is_empty())
            && self.accumulating.as_ref().is_none_or(|m| m.is_empty())
            && self.status.as_ref().is_none_or(|m| m.is_empty())
            && self.tags.as_ref().is_none_or(|t| t.is_empty())
    }

    /// Property-by-property comparison against a previously stored sample set.
    pub fn differs_from(&self, other: &DatumSamples) -> bool {
        if maps_differ(self.instantaneous.as_ref(), other.instantaneous.as_ref())
            || maps_differ(self.accumulating.as_ref(), other.accumulating.as_ref())
            || maps_differ(self.status.as_ref(), other.status.as_ref())
        {
            return true;
        }
        let empty = BTreeSet::new();
        self.tags.as_ref().unwrap_or(&empty) != other.tags.as_ref().unwrap_or(&empty)
    }

    pub fn put_instantaneous(&mut self, key: impl Into<String>, value: impl Into<SampleValue>) {
        self.instantaneous
            .get_or_insert_with(SampleMap::new)
            .insert(key.into(), value.into());
    }

    pub fn put_accumulating(&mut self, key: impl Into<String>, value: impl Into<SampleValue>) {
        self.accumulating
            .get_or_insert_with(SampleMap::new)
            .insert(key.into(), value.into());
    }

    pub fn put_status(&mut self, key: impl Into<String>, value: impl Into<SampleValue>) {
        self.status
            .get_or_insert_with(SampleMap::new)
            .insert(key.into(), value.into());
    }
}

/// A single timestamped sample set of one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    pub kind: ObjectKind,
    pub object_id: i64,
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub samples: DatumSamples,
}

impl Datum {
    pub fn new(
        kind: ObjectKind,
        object_id: i64,
        source_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        samples: DatumSamples,
    ) -> Self {
        Self {
            kind,
            object_id,
            source_id: source_id.into(),
            timestamp,
            samples,
        }
    }

    pub fn stream_key(&self) -> StreamKey {
        StreamKey {
            kind: self.kind,
            object_id: self.object_id,
            source_id: self.source_id.clone(),
        }
    }

    /// Hand this datum to the sink operation matching its object kind.
    pub async fn persist<S: DatumSink + ?Sized>(&self, sink: &S) -> Result<()> {
        match self.kind {
            ObjectKind::Node => sink.store_node_datum(self).await,
            ObjectKind::Location => sink.store_location_datum(self).await,
        }
    }
}

/// Persistence target for datum.
///
/// Both operations are idempotent upserts keyed by stream identity + timestamp.
#[async_trait]
pub trait DatumSink: Send + Sync {
    async fn store_node_datum(&self, datum: &Datum) -> Result<()>;
    async fn store_location_datum(&self, datum: &Datum) -> Result<()>;
}

/// Read side of the datum store, used to reconcile already-stored data.
#[async_trait]
pub trait DatumDao: DatumSink {
    /// Stored datum for `stream` with `start <= timestamp < end`, ordered by timestamp.
    async fn find_stream_datum(
        &self,
        stream: &StreamKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Datum>>;
}
