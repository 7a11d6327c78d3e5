//! In-memory stores.
//!
//! Same contracts as the SQLite repositories, including CAS semantics on task
//! state. Used by tests and by embedders that keep state elsewhere.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::database::repositories::{OwnershipResolver, StreamConfigDao, TaskStore};
use crate::domain::{Datum, DatumDao, DatumSink, StreamConfig, StreamId, StreamKey, Task, TaskState};
use crate::events::{EventSink, UserEvent};
use crate::Result;

/// Task store backed by an ordered map behind a single lock.
pub struct MemoryTaskStore<T: Task> {
    tasks: Mutex<BTreeMap<StreamId, Entry<T>>>,
}

struct Entry<T> {
    task: T,
    /// When the task last entered `Claimed` or `Executing`.
    claimed_at: Option<DateTime<Utc>>,
}

impl<T: Task> Entry<T> {
    fn new(task: T) -> Self {
        let claimed_at = claim_stamp(task.state());
        Self { task, claimed_at }
    }

    fn set_state(&mut self, state: TaskState) {
        self.task = self.task.with_state(state);
        self.claimed_at = claim_stamp(state);
    }
}

fn claim_stamp(state: TaskState) -> Option<DateTime<Utc>> {
    matches!(state, TaskState::Claimed | TaskState::Executing).then(Utc::now)
}

impl<T: Task> Default for MemoryTaskStore<T> {
    fn default() -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<T: Task> MemoryTaskStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

#[async_trait]
impl<T: Task> TaskStore<T> for MemoryTaskStore<T> {
    async fn claim_queued(&self) -> Result<Option<T>> {
        let now = Utc::now();
        let mut tasks = self.tasks.lock();
        let due = tasks
            .values()
            .map(|e| &e.task)
            .filter(|t| t.state() == TaskState::Queued && t.execute_at() <= now)
            .min_by_key(|t| t.execute_at())
            .map(|t| t.id());

        Ok(due.and_then(|id| {
            let entry = tasks.get_mut(&id)?;
            entry.set_state(TaskState::Claimed);
            Some(entry.task.clone())
        }))
    }

    async fn get(&self, id: StreamId) -> Result<Option<T>> {
        Ok(self.tasks.lock().get(&id).map(|e| e.task.clone()))
    }

    async fn save(&self, task: &T) -> Result<()> {
        self.tasks.lock().insert(task.id(), Entry::new(task.clone()));
        Ok(())
    }

    async fn update_state(
        &self,
        id: StreamId,
        new_state: TaskState,
        expected: &[TaskState],
    ) -> Result<bool> {
        let mut tasks = self.tasks.lock();
        let Some(entry) = tasks.get_mut(&id) else {
            return Ok(false);
        };
        if !expected.is_empty() && !expected.contains(&entry.task.state()) {
            return Ok(false);
        }
        entry.set_state(new_state);
        Ok(true)
    }

    async fn update(&self, task: &T, expected: TaskState) -> Result<bool> {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(&task.id()) {
            Some(entry) if entry.task.state() == expected => {
                *entry = Entry::new(task.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_abandoned(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut tasks = self.tasks.lock();
        let mut count = 0;
        for entry in tasks.values_mut() {
            let in_flight = matches!(entry.task.state(), TaskState::Claimed | TaskState::Executing);
            if in_flight && entry.claimed_at.is_some_and(|at| at < older_than) {
                entry.set_state(TaskState::Queued);
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Stream configurations keyed by id.
#[derive(Default)]
pub struct MemoryStreamConfigDao {
    configs: DashMap<StreamId, StreamConfig>,
}

impl MemoryStreamConfigDao {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, config: StreamConfig) {
        self.configs.insert(config.id, config);
    }

    pub fn remove(&self, id: StreamId) -> Option<StreamConfig> {
        self.configs.remove(&id).map(|(_, c)| c)
    }
}

#[async_trait]
impl StreamConfigDao for MemoryStreamConfigDao {
    async fn get(&self, id: StreamId) -> Result<Option<StreamConfig>> {
        Ok(self.configs.get(&id).map(|c| c.clone()))
    }
}

/// Datum store that counts every write it receives.
#[derive(Default)]
pub struct MemoryDatumDao {
    datum: Mutex<BTreeMap<(StreamKey, DateTime<Utc>), Datum>>,
    writes: AtomicUsize,
}

impl MemoryDatumDao {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of store calls received so far, including overwrites.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.datum.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.datum.lock().is_empty()
    }

    pub fn all(&self) -> Vec<Datum> {
        self.datum.lock().values().cloned().collect()
    }

    fn upsert(&self, datum: &Datum) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.datum
            .lock()
            .insert((datum.stream_key(), datum.timestamp), datum.clone());
    }
}

#[async_trait]
impl DatumSink for MemoryDatumDao {
    async fn store_node_datum(&self, datum: &Datum) -> Result<()> {
        self.upsert(datum);
        Ok(())
    }

    async fn store_location_datum(&self, datum: &Datum) -> Result<()> {
        self.upsert(datum);
        Ok(())
    }
}

#[async_trait]
impl DatumDao for MemoryDatumDao {
    async fn find_stream_datum(
        &self,
        stream: &StreamKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Datum>> {
        let lower = (stream.clone(), start);
        let upper = (stream.clone(), end);
        Ok(self
            .datum
            .lock()
            .range(lower..upper)
            .map(|(_, d)| d.clone())
            .collect())
    }
}

/// Node ownership table.
#[derive(Default)]
pub struct MemoryOwnershipResolver {
    owners: DashMap<i64, (i64, Tz)>,
}

impl MemoryOwnershipResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, node_id: i64, user_id: i64, zone: Tz) {
        self.owners.insert(node_id, (user_id, zone));
    }
}

#[async_trait]
impl OwnershipResolver for MemoryOwnershipResolver {
    async fn owner_and_zone(&self, object_id: i64) -> Result<Option<(i64, Tz)>> {
        Ok(self.owners.get(&object_id).map(|o| *o))
    }
}

/// Event sink that keeps every event.
#[derive(Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<UserEvent>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UserEvent> {
        self.events.lock().clone()
    }

    pub fn with_tag(&self, tag: &str) -> Vec<UserEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.has_tag(tag))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn add_event(&self, event: UserEvent) {
        self.events.lock().push(event);
    }
}
