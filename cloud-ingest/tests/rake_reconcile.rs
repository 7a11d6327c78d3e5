use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use cloud_ingest::database::memory::{
    CollectingEventSink, MemoryDatumDao, MemoryOwnershipResolver, MemoryStreamConfigDao,
    MemoryTaskStore,
};
use cloud_ingest::database::repositories::TaskStore;
use cloud_ingest::domain::{
    Datum, DatumDao, DatumQueryResults, DatumSamples, ObjectKind, PollTask, QueryFilter, RakeTask,
    SampleValue, StreamConfig, StreamId, Task, TaskState,
};
use cloud_ingest::engine::{EngineContext, RakeExecutor};
use cloud_ingest::events::{ERROR_TAG, RETRY_TAG, SECURITY_TAG, SUCCESS_TAG};
use cloud_ingest::schedule::day::{add_days, start_of_day, sub_days};
use cloud_ingest::vendor::{VendorDatumSource, VendorError, VendorRegistry};

const SERVICE: &str = "test.rake";
const USER: i64 = 42;
const NODE: i64 = 700;

/// Datum source serving a mutable data set, paginated by an `offset` parameter.
struct ScriptedSource {
    datum: Mutex<Vec<Datum>>,
    page_size: usize,
    calls: Mutex<Vec<QueryFilter>>,
    fail_on_call: Mutex<Option<(usize, VendorError)>>,
}

impl ScriptedSource {
    fn new(datum: Vec<Datum>, page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            datum: Mutex::new(datum),
            page_size,
            calls: Mutex::new(Vec::new()),
            fail_on_call: Mutex::new(None),
        })
    }

    fn calls(&self) -> Vec<QueryFilter> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl VendorDatumSource for ScriptedSource {
    fn service_identifier(&self) -> &str {
        SERVICE
    }

    async fn list_datum(
        &self,
        _config: &StreamConfig,
        filter: &QueryFilter,
    ) -> Result<DatumQueryResults, VendorError> {
        let call = {
            let mut calls = self.calls.lock();
            calls.push(filter.clone());
            calls.len()
        };
        {
            let mut fail = self.fail_on_call.lock();
            if fail.as_ref().is_some_and(|(n, _)| *n == call)
                && let Some((_, e)) = fail.take()
            {
                return Err(e);
            }
        }

        let mut matching: Vec<Datum> = self
            .datum
            .lock()
            .iter()
            .filter(|d| d.timestamp >= filter.start_date && d.timestamp < filter.end_date)
            .cloned()
            .collect();
        matching.sort_by_key(|d| d.timestamp);

        let offset = filter
            .parameters
            .get("offset")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        let page: Vec<Datum> = matching
            .iter()
            .skip(offset)
            .take(self.page_size)
            .cloned()
            .collect();

        if offset + self.page_size < matching.len() {
            let mut next = filter.clone();
            next.parameters
                .insert("offset".into(), Value::from((offset + self.page_size) as u64));
            Ok(DatumQueryResults::with_next(page, next))
        } else {
            Ok(DatumQueryResults::complete(page))
        }
    }
}

struct Harness {
    executor: RakeExecutor,
    rake_store: Arc<MemoryTaskStore<RakeTask>>,
    poll_store: Arc<MemoryTaskStore<PollTask>>,
    configs: Arc<MemoryStreamConfigDao>,
    datum: Arc<MemoryDatumDao>,
    owners: Arc<MemoryOwnershipResolver>,
    events: Arc<CollectingEventSink>,
}

fn harness(source: Arc<ScriptedSource>) -> Harness {
    let rake_store = Arc::new(MemoryTaskStore::new());
    let poll_store = Arc::new(MemoryTaskStore::new());
    let configs = Arc::new(MemoryStreamConfigDao::new());
    let datum = Arc::new(MemoryDatumDao::new());
    let owners = Arc::new(MemoryOwnershipResolver::new());
    let events = Arc::new(CollectingEventSink::new());
    let vendors = Arc::new(VendorRegistry::new().with_source(source));

    let ctx = EngineContext::new(configs.clone(), datum.clone(), events.clone(), vendors);
    let executor = RakeExecutor::new(ctx, rake_store.clone(), poll_store.clone(), owners.clone());
    Harness {
        executor,
        rake_store,
        poll_store,
        configs,
        datum,
        owners,
        events,
    }
}

fn location_config(id: StreamId) -> StreamConfig {
    StreamConfig {
        id,
        kind: ObjectKind::Location,
        object_id: Some(NODE),
        source_id: Some("site/main".into()),
        service_identifier: Some(SERVICE.into()),
        schedule: Some("300".into()),
        service_props: Map::new(),
    }
}

fn node_config(id: StreamId) -> StreamConfig {
    StreamConfig {
        kind: ObjectKind::Node,
        ..location_config(id)
    }
}

fn reading(kind: ObjectKind, source: &str, ts: DateTime<Utc>, watts: f64) -> Datum {
    let mut samples = DatumSamples::default();
    samples.put_instantaneous("watts", watts);
    Datum::new(kind, NODE, source, ts, samples)
}

/// Hourly readings for each day starting at `first_day` (UTC).
fn days_of_readings(first_day: DateTime<Utc>, days: i64, watts: f64) -> Vec<Datum> {
    (0..days * 24)
        .map(|h| {
            reading(
                ObjectKind::Location,
                "site/main",
                first_day + Duration::hours(h),
                watts,
            )
        })
        .collect()
}

struct Setup {
    id: StreamId,
    today: DateTime<Utc>,
    first_day: DateTime<Utc>,
}

/// A claimed rake task reviewing three days back, with a poll watermark at `poll_start`.
async fn setup(h: &Harness, config: StreamConfig, poll_start: Option<DateTime<Utc>>) -> Setup {
    let id = config.id;
    h.configs.insert(config);
    let now = Utc::now();
    let today = start_of_day(now, Tz::UTC);

    let poll_start = poll_start.unwrap_or(now);
    h.poll_store
        .save(&PollTask::new(id, now + Duration::minutes(5), poll_start))
        .await
        .unwrap();
    h.rake_store
        .save(&RakeTask::new(id, now - Duration::minutes(1), Duration::days(3)).with_state(TaskState::Claimed))
        .await
        .unwrap();

    Setup {
        id,
        today,
        first_day: sub_days(today, 3, Tz::UTC),
    }
}

async fn run(h: &Harness, id: StreamId) -> RakeTask {
    let task = h.rake_store.get(id).await.unwrap().unwrap();
    h.executor.execute(&task).await
}

async fn reclaim(h: &Harness, id: StreamId) {
    assert!(
        h.rake_store
            .update_state(id, TaskState::Claimed, &[TaskState::Queued])
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn rake_stops_after_first_unchanged_day() {
    let source = ScriptedSource::new(Vec::new(), 1000);
    let h = harness(source.clone());
    let s = setup(&h, location_config(StreamId::new(USER, 1)), None).await;

    // Vendor and store agree on every day in range.
    let data = days_of_readings(s.first_day, 3, 5.0);
    for d in &data {
        d.persist(h.datum.as_ref()).await.unwrap();
    }
    *source.datum.lock() = data;
    let writes_before = h.datum.writes();

    let result = run(&h, s.id).await;

    assert_eq!(result.state, TaskState::Queued);
    assert_eq!(result.execute_at, add_days(s.today, 1, Tz::UTC));
    assert!(result.message.is_none());
    assert_eq!(source.calls().len(), 1, "loop should stop after the first day");
    assert_eq!(h.datum.writes(), writes_before);

    let success = h.events.with_tag(SUCCESS_TAG);
    assert_eq!(success.len(), 1);
    assert_eq!(success[0].data["updateCount"], 0);
}

#[tokio::test]
async fn rake_walks_every_day_with_changes_and_converges() {
    let source = ScriptedSource::new(Vec::new(), 10);
    let h = harness(source.clone());
    let s = setup(&h, location_config(StreamId::new(USER, 2)), None).await;
    *source.datum.lock() = days_of_readings(s.first_day, 3, 7.5);

    let result = run(&h, s.id).await;

    assert_eq!(result.state, TaskState::Queued);
    assert_eq!(h.datum.len(), 72);

    // Three day windows, 24 readings each in pages of 10.
    let calls = source.calls();
    assert_eq!(calls.len(), 9);
    let mut days: Vec<_> = calls.iter().map(|f| f.start_date).collect();
    days.dedup();
    assert_eq!(
        days,
        vec![
            s.first_day,
            add_days(s.first_day, 1, Tz::UTC),
            add_days(s.first_day, 2, Tz::UTC),
        ]
    );
    assert!(calls.iter().all(|f| f.end_date <= s.today));

    let success = h.events.with_tag(SUCCESS_TAG);
    assert_eq!(success[0].data["updateCount"], 72);
    assert_eq!(success[0].data["sourceCounts"]["site/main"], 72);
}

#[tokio::test]
async fn rake_rerun_over_reconciled_days_writes_nothing() {
    let source = ScriptedSource::new(Vec::new(), 1000);
    let h = harness(source.clone());
    let s = setup(&h, location_config(StreamId::new(USER, 3)), None).await;
    *source.datum.lock() = days_of_readings(s.first_day, 3, 1.0);

    run(&h, s.id).await;
    let writes = h.datum.writes();
    assert_eq!(writes, 72);

    reclaim(&h, s.id).await;
    let result = run(&h, s.id).await;

    assert_eq!(result.state, TaskState::Queued);
    assert_eq!(h.datum.writes(), writes);
}

#[tokio::test]
async fn rake_only_writes_changed_samples() {
    let source = ScriptedSource::new(Vec::new(), 1000);
    let h = harness(source.clone());
    let s = setup(&h, location_config(StreamId::new(USER, 4)), None).await;

    let stored = days_of_readings(s.first_day, 1, 2.0);
    for d in &stored {
        d.persist(h.datum.as_ref()).await.unwrap();
    }
    let mut vendor = stored.clone();
    vendor[3].samples.put_instantaneous("watts", 2.5);
    // Extra reading from a second source of the same object.
    vendor.push(reading(
        ObjectKind::Location,
        "site/aux",
        s.first_day + Duration::minutes(30),
        9.0,
    ));
    *source.datum.lock() = vendor;

    run(&h, s.id).await;

    let success = h.events.with_tag(SUCCESS_TAG);
    assert_eq!(success[0].data["updateCount"], 2);
    assert_eq!(success[0].data["sourceCounts"]["site/main"], 1);
    assert_eq!(success[0].data["sourceCounts"]["site/aux"], 1);

    let key = stored[3].stream_key();
    let found = h
        .datum
        .find_stream_datum(&key, stored[3].timestamp, stored[3].timestamp + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(
        found[0].samples.instantaneous.as_ref().unwrap()["watts"],
        SampleValue::Number(2.5)
    );
}

#[tokio::test]
async fn rake_requeues_without_vendor_call_when_window_passes_watermark() {
    let source = ScriptedSource::new(Vec::new(), 1000);
    let h = harness(source.clone());
    let today = start_of_day(Utc::now(), Tz::UTC);
    // The first window ends two days ago; the poll watermark is earlier than that.
    let poll_start = sub_days(today, 3, Tz::UTC) + Duration::hours(12);
    let s = setup(&h, location_config(StreamId::new(USER, 5)), Some(poll_start)).await;
    let before = h.rake_store.get(s.id).await.unwrap().unwrap();

    let result = run(&h, s.id).await;

    assert!(source.calls().is_empty());
    assert_eq!(result.state, TaskState::Queued);
    assert_eq!(result.execute_at, before.execute_at);
    assert_eq!(result.message, before.message);
    assert_eq!(
        h.rake_store.get(s.id).await.unwrap().unwrap(),
        before.with_state(TaskState::Queued)
    );
    assert!(h.events.is_empty());
}

#[tokio::test]
async fn rake_never_queries_past_the_poll_watermark() {
    let source = ScriptedSource::new(Vec::new(), 1000);
    let h = harness(source.clone());
    let today = start_of_day(Utc::now(), Tz::UTC);
    let poll_start = sub_days(today, 1, Tz::UTC) + Duration::hours(6);
    let s = setup(&h, location_config(StreamId::new(USER, 6)), Some(poll_start)).await;
    *source.datum.lock() = days_of_readings(s.first_day, 3, 3.0);

    let result = run(&h, s.id).await;

    assert_eq!(result.state, TaskState::Queued);
    let calls = source.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|f| f.end_date <= poll_start));
    assert_eq!(h.datum.len(), 48);
}

#[tokio::test]
async fn rake_transient_error_requeues_with_one_minute_nudge() {
    let source = ScriptedSource::new(Vec::new(), 1000);
    let h = harness(source.clone());
    let s = setup(&h, location_config(StreamId::new(USER, 7)), None).await;
    *source.datum.lock() = days_of_readings(s.first_day, 3, 4.0);
    *source.fail_on_call.lock() = Some((
        2,
        VendorError::Http {
            status: 503,
            message: "Service Unavailable".into(),
        },
    ));

    let before = Utc::now();
    let result = run(&h, s.id).await;
    let after = Utc::now();

    assert_eq!(result.state, TaskState::Queued);
    assert!(result.execute_at >= before + Duration::minutes(1));
    assert!(result.execute_at <= after + Duration::minutes(1));
    assert!(result.message.as_deref().is_some_and(|m| m.contains("503")));
    assert_eq!(h.events.with_tag(RETRY_TAG).len(), 1);
    assert!(h.events.with_tag(SUCCESS_TAG).is_empty());
    // First day was stored before the failure.
    assert_eq!(h.datum.len(), 24);
    assert_eq!(h.rake_store.get(s.id).await.unwrap().unwrap(), result);
}

#[tokio::test]
async fn rake_fatal_error_completes_task() {
    let source = ScriptedSource::new(Vec::new(), 1000);
    let h = harness(source.clone());
    let s = setup(&h, location_config(StreamId::new(USER, 8)), None).await;
    *source.fail_on_call.lock() = Some((1, VendorError::Parse("unexpected payload".into())));

    let result = run(&h, s.id).await;

    assert_eq!(result.state, TaskState::Completed);
    assert!(result.message.is_some());
    assert_eq!(h.events.with_tag(ERROR_TAG).len(), 1);
}

#[tokio::test]
async fn rake_aborts_on_foreign_datum() {
    let source = ScriptedSource::new(Vec::new(), 1000);
    let h = harness(source.clone());
    let s = setup(&h, location_config(StreamId::new(USER, 9)), None).await;
    let mut data = days_of_readings(s.first_day, 1, 1.0);
    data[5].object_id = NODE + 1;
    *source.datum.lock() = data;

    let result = run(&h, s.id).await;

    assert_eq!(result.state, TaskState::Completed);
    assert_eq!(h.events.with_tag(SECURITY_TAG).len(), 1);
    assert!(h.datum.is_empty());
}

#[tokio::test]
async fn rake_denies_node_not_owned_by_task_user() {
    let source = ScriptedSource::new(Vec::new(), 1000);
    let h = harness(source.clone());
    h.owners.insert(NODE, USER + 1, Tz::UTC);
    let s = setup(&h, node_config(StreamId::new(USER, 10)), None).await;

    let result = run(&h, s.id).await;

    assert_eq!(result.state, TaskState::Completed);
    assert!(source.calls().is_empty());
    let security = h.events.with_tag(SECURITY_TAG);
    assert_eq!(security.len(), 1);
    assert_eq!(security[0].user_id, USER);
}

#[tokio::test]
async fn rake_uses_owner_time_zone_for_node_streams() {
    let zone: Tz = "Pacific/Auckland".parse().unwrap();
    let source = ScriptedSource::new(Vec::new(), 1000);
    let h = harness(source.clone());
    h.owners.insert(NODE, USER, zone);
    let s = setup(&h, node_config(StreamId::new(USER, 11)), None).await;

    let result = run(&h, s.id).await;

    let local_today = start_of_day(Utc::now(), zone);
    assert_eq!(result.state, TaskState::Queued);
    assert_eq!(result.execute_at, add_days(local_today, 1, zone));
    let calls = source.calls();
    assert_eq!(calls[0].start_date, sub_days(local_today, 3, zone));
}

#[tokio::test]
async fn rake_completes_when_config_missing() {
    let source = ScriptedSource::new(Vec::new(), 1000);
    let h = harness(source.clone());
    let s = setup(&h, location_config(StreamId::new(USER, 12)), None).await;
    h.configs.remove(s.id);

    let result = run(&h, s.id).await;

    assert_eq!(result.state, TaskState::Completed);
    assert_eq!(result.message.as_deref(), Some("datum stream not fully configured"));
    assert_eq!(h.events.with_tag(ERROR_TAG).len(), 1);
}

#[tokio::test]
async fn rake_rejects_offset_that_is_not_whole_days() {
    let source = ScriptedSource::new(Vec::new(), 1000);
    let h = harness(source.clone());
    let s = setup(&h, location_config(StreamId::new(USER, 13)), None).await;
    let task = h.rake_store.get(s.id).await.unwrap().unwrap();
    h.rake_store
        .save(&RakeTask { offset: Duration::hours(36), ..task })
        .await
        .unwrap();

    let result = run(&h, s.id).await;

    assert_eq!(result.state, TaskState::Completed);
    assert!(result.message.as_deref().unwrap().contains("whole number of days"));
    assert!(source.calls().is_empty());
    assert!(h.datum.is_empty());
    assert_eq!(h.events.with_tag(ERROR_TAG).len(), 1);
    assert_eq!(h.rake_store.get(s.id).await.unwrap().unwrap(), result);
}
