//! Domain layer: streams, tasks, datum and vendor queries.

pub mod datum;
pub mod query;
pub mod stream;
pub mod task;

pub use datum::{Datum, DatumDao, DatumSamples, DatumSink, SampleMap, SampleValue};
pub use query::{DatumQueryResults, QueryFilter};
pub use stream::{ObjectKind, StreamConfig, StreamId, StreamKey};
pub use task::{DEFAULT_RAKE_OFFSET_DAYS, PollTask, RakeTask, Task, TaskState};
