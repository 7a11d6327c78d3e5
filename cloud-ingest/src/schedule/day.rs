//! Zone-aware day boundaries.
//!
//! Rake windows are calendar days in the stream owner's time zone, so a
//! "day" may be 23 or 25 hours long across DST transitions.

use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

/// The instant local midnight of `date` occurs in `zone`.
///
/// When midnight falls inside a DST gap the first valid local instant of the day is used.
pub fn start_of_date(date: NaiveDate, zone: Tz) -> DateTime<Utc> {
    let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    let mut local = midnight;
    for _ in 0..4 {
        if let Some(dt) = zone.from_local_datetime(&local).earliest() {
            return dt.with_timezone(&Utc);
        }
        local += chrono::Duration::minutes(30);
    }
    Utc.from_utc_datetime(&midnight)
}

/// Start of the local day containing `instant`.
pub fn start_of_day(instant: DateTime<Utc>, zone: Tz) -> DateTime<Utc> {
    start_of_date(instant.with_timezone(&zone).date_naive(), zone)
}

/// Start of the local day `days` calendar days after the day containing `day_start`.
pub fn add_days(day_start: DateTime<Utc>, days: u64, zone: Tz) -> DateTime<Utc> {
    let date = day_start.with_timezone(&zone).date_naive();
    let shifted = date.checked_add_days(Days::new(days)).unwrap_or(date);
    start_of_date(shifted, zone)
}

/// Start of the local day `days` calendar days before the day containing `day_start`.
pub fn sub_days(day_start: DateTime<Utc>, days: u64, zone: Tz) -> DateTime<Utc> {
    let date = day_start.with_timezone(&zone).date_naive();
    let shifted = date.checked_sub_days(Days::new(days)).unwrap_or(date);
    start_of_date(shifted, zone)
}
