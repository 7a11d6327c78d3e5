//! Datum rows.

use std::str::FromStr;

use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::{Datum, DatumSamples, ObjectKind};
use crate::{Error, Result};

/// Row of the `datum` table. Samples are stored as a JSON document.
#[derive(Debug, Clone, FromRow)]
pub struct DatumDbModel {
    pub kind: String,
    pub object_id: i64,
    pub source_id: String,
    /// Epoch milliseconds
    pub ts: i64,
    pub samples: String,
}

impl DatumDbModel {
    pub fn from_domain(datum: &Datum) -> Result<Self> {
        Ok(Self {
            kind: datum.kind.as_key().to_string(),
            object_id: datum.object_id,
            source_id: datum.source_id.clone(),
            ts: datetime_to_ms(datum.timestamp),
            samples: serde_json::to_string(&datum.samples)?,
        })
    }

    pub fn into_domain(self) -> Result<Datum> {
        let kind = ObjectKind::from_str(&self.kind)
            .map_err(|_| Error::validation(format!("unknown datum kind '{}'", self.kind)))?;
        let samples: DatumSamples = serde_json::from_str(&self.samples)?;
        Ok(Datum {
            kind,
            object_id: self.object_id,
            source_id: self.source_id,
            timestamp: ms_to_datetime(self.ts),
            samples,
        })
    }
}
