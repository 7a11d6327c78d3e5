//! Timestamp helpers for the database layer.
//!
//! Instants are stored as `INTEGER` Unix epoch milliseconds (UTC) and
//! durations (rake offsets) as `INTEGER` milliseconds.

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Convert a `DateTime<Utc>` to Unix epoch milliseconds.
#[inline]
pub fn datetime_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert Unix epoch milliseconds to `DateTime<Utc>`.
///
/// Values outside chrono's supported range clamp to the nearest representable timestamp.
#[inline]
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => {
            if ms.is_negative() {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            }
        }
    }
}

#[inline]
pub fn duration_to_ms(duration: Duration) -> i64 {
    duration.num_milliseconds()
}

#[inline]
pub fn ms_to_duration(ms: i64) -> Duration {
    Duration::milliseconds(ms)
}
