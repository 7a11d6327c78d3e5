//! Poll executor: advance a stream's watermark by one ingestion cycle.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Map;
use tracing::{debug, info, warn};

use super::{EngineContext, TaskError, TaskExecutor, begin_execution, conclude, write_back};
use crate::database::repositories::TaskStore;
use crate::domain::{PollTask, QueryFilter, StreamConfig, TaskState};
use crate::schedule::{Trigger, TriggerContext};
use crate::vendor::{VendorDatumSource, query_all_pages};

/// Runs poll tasks: query `[start_at, now)`, store the results, move the
/// watermark and reschedule from the stream's trigger.
pub struct PollExecutor {
    ctx: EngineContext,
    store: Arc<dyn TaskStore<PollTask>>,
}

impl PollExecutor {
    pub fn new(ctx: EngineContext, store: Arc<dyn TaskStore<PollTask>>) -> Self {
        Self { ctx, store }
    }

    /// Execute one cycle of `task`, which must be `Claimed`.
    pub async fn execute(&self, task: &PollTask) -> PollTask {
        let config = match self.ctx.configs.get(task.id).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                debug!(stream = %task.id, "Stream configuration gone; skipping poll");
                return task.clone();
            }
            Err(e) => {
                return self.conclude(task, TaskState::Claimed, e.into()).await;
            }
        };

        let Some(task) = begin_execution(self.store.as_ref(), self.ctx.events.as_ref(), task).await
        else {
            return task.clone();
        };

        let trigger = match config.schedule.as_deref().map(Trigger::parse) {
            Some(Ok(trigger)) => trigger,
            Some(Err(e)) => {
                debug!(stream = %task.id, error = %e, "Unusable schedule");
                return self
                    .conclude(&task, TaskState::Executing, TaskError::ScheduleUnusable)
                    .await;
            }
            None => {
                return self
                    .conclude(&task, TaskState::Executing, TaskError::ScheduleUnusable)
                    .await;
            }
        };

        let Some(source) = config
            .service_identifier
            .as_deref()
            .and_then(|id| self.ctx.vendors.resolve(id))
        else {
            return self
                .conclude(&task, TaskState::Executing, TaskError::ServiceUnavailable)
                .await;
        };
        if source.requires_properties() && config.service_props.is_empty() {
            return self
                .conclude(&task, TaskState::Executing, TaskError::NoProperties)
                .await;
        }

        let cycle_start = Utc::now();
        let latest = match self.ingest(&config, source.as_ref(), &task, cycle_start).await {
            Ok(latest) => latest,
            Err(e) => return self.conclude(&task, TaskState::Executing, e).await,
        };

        let mut next = task.clone();
        if let Some(latest) = latest
            && latest > next.start_at
        {
            next.start_at = latest;
        }

        let completed = Utc::now();
        let trigger_ctx = TriggerContext::new(task.execute_at, cycle_start, completed);
        let Some(execute_at) = trigger.next_execution(&trigger_ctx) else {
            return self
                .conclude(&next, TaskState::Executing, TaskError::ScheduleUnusable)
                .await;
        };

        next.execute_at = execute_at;
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
                start_at = %next.start_at,
                execute_at = %next.execute_at,
                "Poll cycle complete"
            );
        }
        next
    }

    /// Query and store one window. Returns the newest datum timestamp seen.
    async fn ingest(
        &self,
        config: &StreamConfig,
        source: &dyn VendorDatumSource,
        task: &PollTask,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, TaskError> {
        if task.start_at >= now {
            warn!(stream = %task.id, start_at = %task.start_at, "Watermark is in the future; nothing to query");
            return Ok(None);
        }

        let filter = QueryFilter::range(task.start_at, now);
        let datum = query_all_pages(source, config, filter, self.ctx.max_query_pages).await?;

        let mut latest: Option<DateTime<Utc>> = None;
        for d in &datum {
            d.persist(self.ctx.datum.as_ref()).await?;
            latest = Some(latest.map_or(d.timestamp, |l| l.max(d.timestamp)));
        }

        debug!(stream = %task.id, count = datum.len(), "Stored polled datum");
        Ok(latest)
    }

    async fn conclude(&self, task: &PollTask, expected: TaskState, err: TaskError) -> PollTask {
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
impl TaskExecutor<PollTask> for PollExecutor {
    async fn execute(&self, task: &PollTask) -> PollTask {
        PollExecutor::execute(self, task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::{
        CollectingEventSink, MemoryDatumDao, MemoryStreamConfigDao, MemoryTaskStore,
    };
    use crate::domain::{
        Datum, DatumQueryResults, DatumSamples, ObjectKind, StreamId, Task,
    };
    use crate::events::{ERROR_TAG, RETRY_TAG, WARNING_TAG};
    use crate::vendor::{VendorError, VendorRegistry};
    use chrono::Duration;
    use parking_lot::Mutex;

    const SERVICE: &str = "test.vendor";

    /// Source returning a fixed set of datum inside the requested range, or a scripted error.
    struct FixedSource {
        datum: Vec<Datum>,
        fail_with: Mutex<Option<VendorError>>,
        calls: Mutex<Vec<QueryFilter>>,
    }

    impl FixedSource {
        fn new(datum: Vec<Datum>) -> Self {
            Self {
                datum,
                fail_with: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VendorDatumSource for FixedSource {
        fn service_identifier(&self) -> &str {
            SERVICE
        }

        async fn list_datum(
            &self,
            _config: &StreamConfig,
            filter: &QueryFilter,
        ) -> Result<DatumQueryResults, VendorError> {
            self.calls.lock().push(filter.clone());
            if let Some(e) = self.fail_with.lock().take() {
                return Err(e);
            }
            Ok(DatumQueryResults::complete(
                self.datum
                    .iter()
                    .filter(|d| d.timestamp >= filter.start_date && d.timestamp < filter.end_date)
                    .cloned()
                    .collect(),
            ))
        }
    }

    struct Harness {
        executor: PollExecutor,
        store: Arc<MemoryTaskStore<PollTask>>,
        configs: Arc<MemoryStreamConfigDao>,
        datum: Arc<MemoryDatumDao>,
        events: Arc<CollectingEventSink>,
    }

    fn harness(source: Arc<FixedSource>) -> Harness {
        let store = Arc::new(MemoryTaskStore::new());
        let configs = Arc::new(MemoryStreamConfigDao::new());
        let datum = Arc::new(MemoryDatumDao::new());
        let events = Arc::new(CollectingEventSink::new());
        let vendors = Arc::new(VendorRegistry::new().with_source(source));
        let ctx = EngineContext::new(configs.clone(), datum.clone(), events.clone(), vendors);
        Harness {
            executor: PollExecutor::new(ctx, store.clone()),
            store,
            configs,
            datum,
            events,
        }
    }

    fn config(id: StreamId, schedule: &str) -> StreamConfig {
        StreamConfig {
            id,
            kind: ObjectKind::Node,
            object_id: Some(100),
            source_id: Some("meter/1".into()),
            service_identifier: Some(SERVICE.into()),
            schedule: Some(schedule.into()),
            service_props: Map::new(),
        }
    }

    fn reading(ts: DateTime<Utc>, watts: f64) -> Datum {
        let mut samples = DatumSamples::default();
        samples.put_instantaneous("watts", watts);
        Datum::new(ObjectKind::Node, 100, "meter/1", ts, samples)
    }

    async fn claimed(h: &Harness, task: PollTask) -> PollTask {
        let task = task.with_state(TaskState::Claimed);
        h.store.save(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_cycle_advances_watermark_and_reschedules() {
        let t0 = Utc::now() - Duration::minutes(5);
        let id = StreamId::new(1, 1);
        let source = Arc::new(FixedSource::new(vec![
            reading(t0 + Duration::minutes(2), 10.0),
            reading(t0 + Duration::minutes(4), 12.0),
        ]));
        let h = harness(source.clone());
        h.configs.insert(config(id, "300"));
        let scheduled = t0 + Duration::minutes(5);
        let task = claimed(&h, PollTask::new(id, scheduled, t0)).await;

        let result = h.executor.execute(&task).await;

        assert_eq!(result.state, TaskState::Queued);
        assert_eq!(result.start_at, t0 + Duration::minutes(4));
        assert_eq!(result.execute_at, scheduled + Duration::minutes(5));
        assert!(result.message.is_none());
        assert_eq!(h.datum.len(), 2);
        assert_eq!(h.store.get(id).await.unwrap().unwrap(), result);
        assert!(h.events.is_empty());

        let calls = source.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].start_date, t0);
    }

    #[tokio::test]
    async fn test_watermark_never_moves_backwards() {
        let t0 = Utc::now() - Duration::minutes(10);
        let id = StreamId::new(1, 2);
        // Only datum older than the watermark: nothing falls inside the window.
        let source = Arc::new(FixedSource::new(vec![reading(t0 - Duration::hours(1), 1.0)]));
        let h = harness(source);
        h.configs.insert(config(id, "60"));
        let task = claimed(&h, PollTask::new(id, Utc::now(), t0)).await;

        let result = h.executor.execute(&task).await;
        assert_eq!(result.state, TaskState::Queued);
        assert!(result.start_at >= task.start_at);
        assert_eq!(result.start_at, t0);
    }

    #[tokio::test]
    async fn test_missing_config_returns_task_unchanged() {
        let h = harness(Arc::new(FixedSource::new(Vec::new())));
        let now = Utc::now();
        let task = claimed(&h, PollTask::new(StreamId::new(9, 9), now, now)).await;

        let result = h.executor.execute(&task).await;

        assert_eq!(result, task);
        assert_eq!(h.store.get(task.id).await.unwrap().unwrap(), task);
        assert!(h.events.is_empty());
    }

    #[tokio::test]
    async fn test_unusable_schedule_completes_task() {
        let id = StreamId::new(1, 3);
        let h = harness(Arc::new(FixedSource::new(Vec::new())));
        h.configs.insert(config(id, "not a schedule"));
        let now = Utc::now();
        let task = claimed(&h, PollTask::new(id, now, now)).await;

        let result = h.executor.execute(&task).await;

        assert_eq!(result.state, TaskState::Completed);
        assert_eq!(result.message.as_deref(), Some("schedule not usable"));
        assert_eq!(h.events.with_tag(ERROR_TAG).len(), 1);
        assert_eq!(h.store.get(id).await.unwrap().unwrap().state, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_unknown_service_completes_task() {
        let id = StreamId::new(1, 4);
        let h = harness(Arc::new(FixedSource::new(Vec::new())));
        let mut cfg = config(id, "300");
        cfg.service_identifier = Some("nope".into());
        h.configs.insert(cfg);
        let now = Utc::now();
        let task = claimed(&h, PollTask::new(id, now, now)).await;

        let result = h.executor.execute(&task).await;

        assert_eq!(result.state, TaskState::Completed);
        assert_eq!(result.message.as_deref(), Some("service not available"));
        assert_eq!(h.events.with_tag(ERROR_TAG).len(), 1);
    }

    #[tokio::test]
    async fn test_lost_claim_emits_warning_and_leaves_task() {
        let id = StreamId::new(1, 5);
        let h = harness(Arc::new(FixedSource::new(Vec::new())));
        h.configs.insert(config(id, "300"));
        let now = Utc::now();
        let task = claimed(&h, PollTask::new(id, now, now)).await;
        // Someone else already moved it on.
        h.store
            .update_state(id, TaskState::Executing, &[TaskState::Claimed])
            .await
            .unwrap();

        let result = h.executor.execute(&task).await;

        assert_eq!(result, task);
        assert_eq!(h.events.with_tag(WARNING_TAG).len(), 1);
        assert_eq!(h.store.get(id).await.unwrap().unwrap().state, TaskState::Executing);
    }

    #[tokio::test]
    async fn test_transient_vendor_error_requeues_with_nudge() {
        let id = StreamId::new(1, 6);
        let source = Arc::new(FixedSource::new(Vec::new()));
        *source.fail_with.lock() = Some(VendorError::Http {
            status: 502,
            message: "bad gateway".into(),
        });
        let h = harness(source);
        h.configs.insert(config(id, "300"));
        let t0 = Utc::now() - Duration::minutes(10);
        let task = claimed(&h, PollTask::new(id, t0, t0)).await;

        let before = Utc::now();
        let result = h.executor.execute(&task).await;

        assert_eq!(result.state, TaskState::Queued);
        assert_eq!(result.start_at, t0);
        assert!(result.execute_at >= before + Duration::seconds(59));
        assert!(result.message.is_some());
        assert_eq!(h.events.with_tag(RETRY_TAG).len(), 1);
    }
}
