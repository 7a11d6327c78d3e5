//! Stream configuration rows.

use std::str::FromStr;

use sqlx::FromRow;

use super::{parse_props, props_to_json};
use crate::domain::{ObjectKind, StreamConfig, StreamId};
use crate::{Error, Result};

/// Row of the `datum_stream` table.
#[derive(Debug, Clone, FromRow)]
pub struct StreamConfigDbModel {
    pub user_id: i64,
    pub config_id: i64,
    /// n = node, l = location
    pub kind: String,
    pub object_id: Option<i64>,
    pub source_id: Option<String>,
    pub service_ident: Option<String>,
    pub schedule: Option<String>,
    pub service_props: String,
}

impl StreamConfigDbModel {
    pub fn from_domain(config: &StreamConfig) -> Result<Self> {
        Ok(Self {
            user_id: config.id.user_id,
            config_id: config.id.config_id,
            kind: config.kind.as_key().to_string(),
            object_id: config.object_id,
            source_id: config.source_id.clone(),
            service_ident: config.service_identifier.clone(),
            schedule: config.schedule.clone(),
            service_props: props_to_json(&config.service_props)?,
        })
    }

    pub fn into_domain(self) -> Result<StreamConfig> {
        let kind = ObjectKind::from_str(&self.kind)
            .map_err(|_| Error::validation(format!("unknown stream kind '{}'", self.kind)))?;
        Ok(StreamConfig {
            id: StreamId::new(self.user_id, self.config_id),
            kind,
            object_id: self.object_id,
            source_id: self.source_id,
            service_identifier: self.service_ident,
            schedule: self.schedule,
            service_props: parse_props(&self.service_props)?,
        })
    }
}
