//! Vendor query filter and paged results.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Datum;

/// Half-open time-range query: `start_date <= ts < end_date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

impl QueryFilter {
    pub fn range(start_date: DateTime<Utc>, end_date: DateTime<Utc>) -> Self {
        Self {
            start_date,
            end_date,
            parameters: Map::new(),
            max: None,
        }
    }

    pub fn span(&self) -> Duration {
        self.end_date - self.start_date
    }
}

/// One page of vendor results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatumQueryResults {
    pub results: Vec<Datum>,
    /// Present when more data is available beyond the filter that produced this page.
    pub next_query_filter: Option<QueryFilter>,
}

impl DatumQueryResults {
    pub fn complete(results: Vec<Datum>) -> Self {
        Self {
            results,
            next_query_filter: None,
        }
    }

    pub fn with_next(results: Vec<Datum>, next: QueryFilter) -> Self {
        Self {
            results,
            next_query_filter: Some(next),
        }
    }
}
