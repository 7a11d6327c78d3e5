//! Schedule expressions resolved into triggers.
//!
//! A schedule is either a period in whole seconds (`"300"`) or a cron
//! expression. Cron expressions use the six/seven field form with a leading
//! seconds field; five-field unix expressions are accepted and fire at second 0.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use thiserror::Error;

/// Why a schedule string cannot be turned into a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    #[error("schedule is empty")]
    Empty,

    #[error("period must be greater than zero")]
    ZeroPeriod,

    #[error("invalid period '{0}'")]
    InvalidPeriod(String),

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
}

/// Execution history a trigger uses to compute its next fire time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerContext {
    /// When the previous execution was scheduled to run.
    pub last_scheduled: Option<DateTime<Utc>>,
    /// When the previous execution actually started.
    pub last_actual: Option<DateTime<Utc>>,
    /// When the previous execution finished.
    pub last_completion: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl TriggerContext {
    /// A context with no history.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            last_scheduled: None,
            last_actual: None,
            last_completion: None,
            now,
        }
    }

    pub fn new(
        last_scheduled: DateTime<Utc>,
        last_actual: DateTime<Utc>,
        last_completion: DateTime<Utc>,
    ) -> Self {
        Self {
            last_scheduled: Some(last_scheduled),
            last_actual: Some(last_actual),
            last_completion: Some(last_completion),
            now: last_completion,
        }
    }
}

/// A resolved schedule.
#[derive(Clone)]
pub enum Trigger {
    /// Fixed-rate period anchored on the previous scheduled time.
    Periodic { period: Duration },
    /// Cron expression evaluated in a time zone.
    Cron {
        expression: String,
        schedule: cron::Schedule,
        zone: Tz,
    },
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Periodic { period } => f
                .debug_struct("Periodic")
                .field("period_secs", &period.num_seconds())
                .finish(),
            Self::Cron {
                expression, zone, ..
            } => f
                .debug_struct("Cron")
                .field("expression", expression)
                .field("zone", zone)
                .finish(),
        }
    }
}

impl Trigger {
    /// Parse a schedule, evaluating cron expressions in UTC.
    pub fn parse(schedule: &str) -> Result<Self, TriggerError> {
        Self::parse_in(schedule, chrono_tz::UTC)
    }

    /// Parse a schedule, evaluating cron expressions in `zone`.
    pub fn parse_in(schedule: &str, zone: Tz) -> Result<Self, TriggerError> {
        let schedule = schedule.trim();
        if schedule.is_empty() {
            return Err(TriggerError::Empty);
        }

        if schedule.bytes().all(|b| b.is_ascii_digit()) {
            let secs: i64 = schedule
                .parse()
                .map_err(|_| TriggerError::InvalidPeriod(schedule.to_string()))?;
            if secs == 0 {
                return Err(TriggerError::ZeroPeriod);
            }
            let period = Duration::try_seconds(secs)
                .ok_or_else(|| TriggerError::InvalidPeriod(schedule.to_string()))?;
            return Ok(Self::Periodic { period });
        }

        let fields = schedule.split_whitespace().count();
        let expression = if fields == 5 {
            format!("0 {schedule}")
        } else {
            schedule.to_string()
        };

        let parsed = cron::Schedule::from_str(&expression).map_err(|e| TriggerError::InvalidCron {
            expression: schedule.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self::Cron {
            expression,
            schedule: parsed,
            zone,
        })
    }

    /// Next execution instant given the previous execution history.
    ///
    /// Returns `None` only when a cron expression has no future fire time.
    pub fn next_execution(&self, ctx: &TriggerContext) -> Option<DateTime<Utc>> {
        match self {
            Self::Periodic { period } => Some(next_periodic(*period, ctx)),
            Self::Cron { schedule, zone, .. } => {
                let mut from = ctx.last_completion.unwrap_or(ctx.now);
                if let Some(scheduled) = ctx.last_scheduled
                    && scheduled > from
                {
                    from = scheduled;
                }
                schedule
                    .after(&from.with_timezone(zone))
                    .next()
                    .map(|dt| dt.with_timezone(&Utc))
            }
        }
    }
}

/// Next slot on the grid `anchor + n * period` strictly after the last completion.
///
/// Late completions skip missed slots instead of shifting the whole grid.
fn next_periodic(period: Duration, ctx: &TriggerContext) -> DateTime<Utc> {
    let anchor = ctx.last_scheduled.or(ctx.last_actual).unwrap_or(ctx.now);
    let reference = ctx.last_completion.unwrap_or(ctx.now);

    let next = anchor + period;
    if next > reference {
        return next;
    }

    let period_ms = period.num_milliseconds().max(1);
    let behind_ms = (reference - anchor).num_milliseconds();
    let slots = behind_ms / period_ms + 1;
    anchor + Duration::milliseconds(period_ms.saturating_mul(slots))
}
