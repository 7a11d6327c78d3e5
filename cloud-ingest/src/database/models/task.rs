//! Poll and rake task rows.

use std::str::FromStr;

use sqlx::FromRow;

use super::{parse_props, props_to_json};
use crate::database::time::{datetime_to_ms, duration_to_ms, ms_to_datetime, ms_to_duration};
use crate::domain::{PollTask, RakeTask, StreamId, TaskState};
use crate::{Error, Result};

fn parse_state(raw: &str) -> Result<TaskState> {
    TaskState::from_str(raw).map_err(|_| Error::validation(format!("unknown task status '{raw}'")))
}

/// Row of the `poll_task` table.
#[derive(Debug, Clone, FromRow)]
pub struct PollTaskDbModel {
    pub user_id: i64,
    pub config_id: i64,
    /// Single-char state key: q, c, e, d
    pub status: String,
    /// Epoch milliseconds
    pub exec_at: i64,
    /// Epoch milliseconds
    pub start_at: i64,
    pub message: Option<String>,
    /// JSON object
    pub service_props: String,
}

impl PollTaskDbModel {
    pub fn from_domain(task: &PollTask) -> Result<Self> {
        Ok(Self {
            user_id: task.id.user_id,
            config_id: task.id.config_id,
            status: task.state.as_key().to_string(),
            exec_at: datetime_to_ms(task.execute_at),
            start_at: datetime_to_ms(task.start_at),
            message: task.message.clone(),
            service_props: props_to_json(&task.service_props)?,
        })
    }

    pub fn into_domain(self) -> Result<PollTask> {
        Ok(PollTask {
            id: StreamId::new(self.user_id, self.config_id),
            state: parse_state(&self.status)?,
            execute_at: ms_to_datetime(self.exec_at),
            start_at: ms_to_datetime(self.start_at),
            message: self.message,
            service_props: parse_props(&self.service_props)?,
        })
    }
}

/// Row of the `rake_task` table.
#[derive(Debug, Clone, FromRow)]
pub struct RakeTaskDbModel {
    pub user_id: i64,
    pub config_id: i64,
    pub status: String,
    pub exec_at: i64,
    pub offset_ms: i64,
    pub message: Option<String>,
    pub service_props: String,
}

impl RakeTaskDbModel {
    pub fn from_domain(task: &RakeTask) -> Result<Self> {
        Ok(Self {
            user_id: task.id.user_id,
            config_id: task.id.config_id,
            status: task.state.as_key().to_string(),
            exec_at: datetime_to_ms(task.execute_at),
            offset_ms: duration_to_ms(task.offset),
            message: task.message.clone(),
            service_props: props_to_json(&task.service_props)?,
        })
    }

    pub fn into_domain(self) -> Result<RakeTask> {
        Ok(RakeTask {
            id: StreamId::new(self.user_id, self.config_id),
            state: parse_state(&self.status)?,
            execute_at: ms_to_datetime(self.exec_at),
            offset: ms_to_duration(self.offset_ms),
            message: self.message,
            service_props: parse_props(&self.service_props)?,
        })
    }
}
