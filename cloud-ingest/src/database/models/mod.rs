//! Database row models.
//!
//! Each model mirrors one table row and converts to and from the domain type.

pub mod datum;
pub mod stream;
pub mod task;

pub use datum::*;
pub use stream::*;
pub use task::*;

use serde_json::{Map, Value};

use crate::Result;

/// Decode a JSON object column; blank or `null` yields an empty map.
pub(crate) fn parse_props(raw: &str) -> Result<Map<String, Value>> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(crate::Error::validation(format!(
            "expected JSON object, found {other}"
        ))),
    }
}

pub(crate) fn props_to_json(props: &Map<String, Value>) -> Result<String> {
    Ok(serde_json::to_string(props)?)
}
