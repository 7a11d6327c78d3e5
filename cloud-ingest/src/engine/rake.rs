//! Rake executor: re-query settled days and reconcile late or corrected datum.
//!
//! A rake cycle walks day windows in the stream owner's zone, starting
//! `offset` days before today, and upserts only datum that is new or whose
//! samples differ from what is stored. The walk stops at the first day that
//! needs no updates.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{EngineContext, TaskError, TaskExecutor, begin_execution, conclude, write_back};
use crate::database::repositories::{OwnershipResolver, TaskStore};
use crate::domain::{
    Datum, ObjectKind, PollTask, QueryFilter, RakeTask, StreamConfig, StreamKey, Task, TaskState,
};
use crate::events::{INTEGRATION_TAG, RAKE_TAG, SUCCESS_TAG, UserEvent};
use crate::schedule::day::{add_days, start_of_day, sub_days};
use crate::vendor::{VendorDatumSource, query_all_pages};

/// Update counts of one rake cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RakeSummary {
    pub days: usize,
    pub total: usize,
    pub per_source: BTreeMap<String, usize>,
}

impl RakeSummary {
    fn per_source_json(&self) -> Value {
        Value::Object(
            self.per_source
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(*v)))
                .collect::<Map<_, _>>(),
        )
    }
}

/// Runs rake tasks.
pub struct RakeExecutor {
    ctx: EngineContext,
    store: Arc<dyn TaskStore<RakeTask>>,
    poll_store: Arc<dyn TaskStore<PollTask>>,
    ownership: Arc<dyn OwnershipResolver>,
}

impl RakeExecutor {
    pub fn new(
        ctx: EngineContext,
        store: Arc<dyn TaskStore<RakeTask>>,
        poll_store: Arc<dyn TaskStore<PollTask>>,
        ownership: Arc<dyn OwnershipResolver>,
    ) -> Self {
        Self {
            ctx,
            store,
            poll_store,
            ownership,
        }
    }

    /// Execute one cycle of `task`, which must be `Claimed`.
    pub async fn execute(&self, task: &RakeTask) -> RakeTask {
        let Some(offset_days) = whole_days(task.offset) else {
            return self
                .conclude(task, TaskState::Claimed, TaskError::InvalidOffset(task.offset))
                .await;
        };

        let config = match self.ctx.configs.get(task.id).await {
            Ok(Some(config)) if config.is_fully_configured() => config,
            Ok(_) => {
                return self
                    .conclude(task, TaskState::Claimed, TaskError::NotFullyConfigured)
                    .await;
            }
            Err(e) => return self.conclude(task, TaskState::Claimed, e.into()).await,
        };

        let zone = match self.zone_for(task, &config).await {
            Ok(zone) => zone,
            Err(e) => return self.conclude(task, TaskState::Claimed, e).await,
        };

        let Some(source) = config
            .service_identifier
            .as_deref()
            .and_then(|id| self.ctx.vendors.resolve(id))
        else {
            return self
                .conclude(task, TaskState::Claimed, TaskError::ServiceUnavailable)
                .await;
        };
        if source.requires_properties() && config.service_props.is_empty() {
            return self
                .conclude(task, TaskState::Claimed, TaskError::NoProperties)
                .await;
        }

        let now = Utc::now();
        let today = start_of_day(now, zone);
        let day_start = sub_days(today, offset_days, zone);
        let window_end = add_days(day_start, 1, zone);

        let poll_start = match self.poll_store.get(task.id).await {
            Ok(poll) => poll.map(|p| p.start_at),
            Err(e) => return self.conclude(task, TaskState::Claimed, e.into()).await,
        };

        if let Some(poll_start) = poll_start
            && window_end > poll_start
        {
            debug!(
                stream = %task.id,
                window_end = %window_end,
                poll_start = %poll_start,
                "Rake window not yet covered by poll watermark; re-queueing"
            );
            return self.requeue(task).await;
        }

        let Some(task) = begin_execution(self.store.as_ref(), self.ctx.events.as_ref(), task).await
        else {
            return task.clone();
        };

        let limit = poll_start.map_or(now, |p| p.min(now));
        let max_date = start_of_day(limit, zone);

        let summary = match self
            .reconcile(&config, source.as_ref(), zone, day_start, max_date)
            .await
        {
            Ok(summary) => summary,
            Err(e) => return self.conclude(&task, TaskState::Executing, e).await,
        };

        let mut next = task.clone();
        next.execute_at = add_days(today, 1, zone);
        next.state = TaskState::Queued;
        next.message = None;
        next.service_props = Map::new();

        if write_back(
            self.store.as_ref(),
            self.ctx.events.as_ref(),
            &next,
            TaskState::Executing,
        )
        .await
        {
            info!(
                stream = %next.id,
                days = summary.days,
                updates = summary.total,
                execute_at = %next.execute_at,
                "Rake cycle complete"
            );
            self.ctx
                .events
                .add_event(
                    UserEvent::for_stream(
                        next.id,
                        &[INTEGRATION_TAG, RAKE_TAG, SUCCESS_TAG],
                        format!("Rake updated {} datum", summary.total),
                    )
                    .with_data("updateCount", summary.total)
                    .with_data("sourceCounts", summary.per_source_json())
                    .with_data("executeAt", next.execute_at.to_rfc3339()),
                )
                .await;
        }
        next
    }

    /// Zone of the rake windows; node streams must be owned by the task's user.
    async fn zone_for(&self, task: &RakeTask, config: &StreamConfig) -> Result<Tz, TaskError> {
        match config.kind {
            ObjectKind::Location => Ok(Tz::UTC),
            ObjectKind::Node => {
                let node_id = config.object_id.ok_or(TaskError::NotFullyConfigured)?;
                match self.ownership.owner_and_zone(node_id).await? {
                    Some((owner, zone)) if owner == task.id.user_id => Ok(zone),
                    Some(_) => Err(TaskError::AuthorizationDenied(format!(
                        "node {node_id} is not owned by user {}",
                        task.id.user_id
                    ))),
                    None => Err(TaskError::AuthorizationDenied(format!(
                        "node {node_id} not found"
                    ))),
                }
            }
        }
    }

    /// Walk day windows from `day_start` while the window ends on or before `max_date`.
    async fn reconcile(
        &self,
        config: &StreamConfig,
        source: &dyn VendorDatumSource,
        zone: Tz,
        mut day_start: DateTime<Utc>,
        max_date: DateTime<Utc>,
    ) -> Result<RakeSummary, TaskError> {
        let mut summary = RakeSummary::default();
        let mut window_end = add_days(day_start, 1, zone);

        while window_end <= max_date {
            let filter = QueryFilter::range(day_start, window_end);
            let datum = query_all_pages(source, config, filter, self.ctx.max_query_pages).await?;
            let updated = self.reconcile_day(config, datum, day_start, window_end, &mut summary).await?;
            summary.days += 1;

            debug!(stream = %config.id, day = %day_start, updated, "Rake day reconciled");
            if updated == 0 {
                break;
            }
            day_start = window_end;
            window_end = add_days(day_start, 1, zone);
        }

        Ok(summary)
    }

    /// Store new or changed datum of one day. Returns the number of rows written.
    async fn reconcile_day(
        &self,
        config: &StreamConfig,
        mut datum: Vec<Datum>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        summary: &mut RakeSummary,
    ) -> Result<usize, TaskError> {
        if let Some(stray) = datum
            .iter()
            .find(|d| d.kind != config.kind || Some(d.object_id) != config.object_id)
        {
            return Err(TaskError::AuthorizationDenied(format!(
                "datum for {} does not belong to stream {}",
                stray.stream_key(),
                config.id
            )));
        }

        datum.sort_by(|a, b| {
            (&a.source_id, a.timestamp).cmp(&(&b.source_id, b.timestamp))
        });

        let mut updated = 0;
        let mut current: Option<(StreamKey, HashMap<DateTime<Utc>, Datum>)> = None;
        for d in datum {
            let key = d.stream_key();
            if current.as_ref().is_none_or(|(k, _)| *k != key) {
                let existing = self
                    .ctx
                    .datum
                    .find_stream_datum(&key, start, end)
                    .await?
                    .into_iter()
                    .map(|e| (e.timestamp, e))
                    .collect();
                current = Some((key, existing));
            }

            let Some((_, existing)) = current.as_ref() else {
                continue;
            };
            let changed = existing
                .get(&d.timestamp)
                .is_none_or(|e| d.samples.differs_from(&e.samples));
            if changed {
                d.persist(self.ctx.datum.as_ref()).await?;
                *summary.per_source.entry(d.source_id.clone()).or_default() += 1;
                summary.total += 1;
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Return a claimed task to the queue untouched.
    async fn requeue(&self, task: &RakeTask) -> RakeTask {
        match self
            .store
            .update_state(task.id, TaskState::Queued, &[TaskState::Claimed])
            .await
        {
            Ok(true) => task.with_state(TaskState::Queued),
            Ok(false) => self.conclude(task, TaskState::Claimed, TaskError::StateConflict).await,
            Err(e) => self.conclude(task, TaskState::Claimed, e.into()).await,
        }
    }

    async fn conclude(&self, task: &RakeTask, expected: TaskState, err: TaskError) -> RakeTask {
        conclude(
            self.store.as_ref(),
            self.ctx.events.as_ref(),
            task,
            expected,
            err,
        )
        .await
    }
}

#[async_trait]
impl TaskExecutor<RakeTask> for RakeExecutor {
    async fn execute(&self, task: &RakeTask) -> RakeTask {
        RakeExecutor::execute(self, task).await
    }
}

/// Number of days in `offset`, or `None` if it is negative or not whole days.
fn whole_days(offset: chrono::Duration) -> Option<u64> {
    if offset < chrono::Duration::zero() || offset.num_milliseconds() % 86_400_000 != 0 {
        return None;
    }
    u64::try_from(offset.num_days()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_whole_days() {
        assert_eq!(whole_days(Duration::zero()), Some(0));
        assert_eq!(whole_days(Duration::days(3)), Some(3));
        assert_eq!(whole_days(Duration::hours(36)), None);
        assert_eq!(whole_days(Duration::days(1) + Duration::milliseconds(1)), None);
        assert_eq!(whole_days(Duration::days(-1)), None);
    }
}
