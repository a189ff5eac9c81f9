//! Trigger engine: computes when a job should next fire.
//!
//! Three trigger families: cron expressions (5 or 6 fields, optional IANA
//! timezone), fixed intervals with optional start/end bounds, and one-shot
//! absolute dates. Every variant answers "next fire time strictly after T"
//! or reports that no further occurrences exist.

use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::SchedulerError;

/// When and how often a job fires.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Cron-style schedule.
    Cron(CronTrigger),
    /// Fixed period between fires.
    Interval(IntervalTrigger),
    /// Fires exactly once.
    Date(DateTrigger),
}

impl Trigger {
    /// Cron trigger from a 5-field (`minute hour day month weekday`) or
    /// 6-field (leading seconds) expression.
    pub fn cron(expression: &str) -> Result<Self, SchedulerError> {
        Ok(Self::Cron(CronTrigger::new(expression, None)?))
    }

    /// Cron trigger with an explicit IANA timezone.
    pub fn cron_tz(expression: &str, timezone: &str) -> Result<Self, SchedulerError> {
        Ok(Self::Cron(CronTrigger::new(
            expression,
            Some(parse_timezone(timezone)?),
        )?))
    }

    /// Cron trigger from explicit fields.
    ///
    /// Produces a schedule identical to the equivalent string form.
    pub fn cron_fields(fields: CronFields) -> Result<Self, SchedulerError> {
        let timezone = match &fields.timezone {
            Some(tz) => Some(parse_timezone(tz)?),
            None => None,
        };
        Ok(Self::Cron(CronTrigger::new(&fields.expression(), timezone)?))
    }

    /// Interval trigger; the spec durations are summed into one period.
    pub fn interval(spec: IntervalSpec) -> Result<Self, SchedulerError> {
        Ok(Self::Interval(IntervalTrigger::new(spec)?))
    }

    /// One-shot trigger at `run_date`.
    pub fn once(run_date: DateTime<Utc>) -> Self {
        Self::Date(DateTrigger { run_date })
    }

    /// One-shot trigger from an RFC 3339 or `YYYY-MM-DD HH:MM:SS` string,
    /// interpreted in UTC when no offset or timezone is given.
    pub fn once_str(run_date: &str) -> Result<Self, SchedulerError> {
        Ok(Self::Date(DateTrigger::parse(run_date, None)?))
    }

    /// One-shot trigger from a date string interpreted in `timezone`.
    pub fn once_str_tz(run_date: &str, timezone: &str) -> Result<Self, SchedulerError> {
        let tz = parse_timezone(timezone)?;
        Ok(Self::Date(DateTrigger::parse(run_date, Some(tz))?))
    }

    /// Next fire time strictly after `after`, or `None` when the trigger
    /// has no further occurrences. Cron triggers without an explicit
    /// timezone are evaluated in UTC.
    pub fn next_fire_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_fire_time_in(after, chrono_tz::UTC)
    }

    /// Like [`next_fire_time`](Self::next_fire_time), with `default_tz`
    /// standing in for cron triggers that did not set a timezone. The
    /// scheduler passes its configured default here, keeping evaluation
    /// itself a pure function of the inputs.
    pub fn next_fire_time_in(
        &self,
        after: DateTime<Utc>,
        default_tz: Tz,
    ) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron(cron) => cron.next_fire_time(after, default_tz),
            Trigger::Interval(interval) => interval.next_fire_time(after),
            Trigger::Date(date) => date.next_fire_time(after),
        }
    }
}

/// Cron-style trigger with optional timezone.
#[derive(Debug, Clone)]
pub struct CronTrigger {
    expression: String,
    schedule: Schedule,
    timezone: Option<Tz>,
}

impl CronTrigger {
    fn new(expression: &str, timezone: Option<Tz>) -> Result<Self, SchedulerError> {
        let field_count = expression.split_whitespace().count();
        // The cron crate wants a leading seconds field; standard 5-field
        // expressions get second 0 so they keep minute granularity.
        let normalized = match field_count {
            5 => format!("0 {expression}"),
            6 => expression.to_string(),
            n => {
                return Err(SchedulerError::InvalidCronExpression(format!(
                    "expected 5 or 6 fields, got {n}: {expression:?}"
                )));
            }
        };

        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| SchedulerError::InvalidCronExpression(format!("{expression:?}: {e}")))?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
            timezone,
        })
    }

    /// The expression as the caller supplied it.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Explicit timezone, if one was set.
    pub fn timezone(&self) -> Option<Tz> {
        self.timezone
    }

    fn next_fire_time(&self, after: DateTime<Utc>, default_tz: Tz) -> Option<DateTime<Utc>> {
        let tz = self.timezone.unwrap_or(default_tz);
        let local_after = after.with_timezone(&tz);
        self.schedule
            .after(&local_after)
            .next()
            .map(|next| next.with_timezone(&Utc))
    }
}

/// Explicit field form of a cron schedule.
///
/// Unset fields default to `*`, except `second` which defaults to `0` so
/// the field form matches the 5-field string form.
#[derive(Debug, Clone, Default)]
pub struct CronFields {
    pub second: Option<String>,
    pub minute: Option<String>,
    pub hour: Option<String>,
    pub day: Option<String>,
    pub month: Option<String>,
    pub day_of_week: Option<String>,
    pub timezone: Option<String>,
}

impl CronFields {
    fn expression(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.second.as_deref().unwrap_or("0"),
            self.minute.as_deref().unwrap_or("*"),
            self.hour.as_deref().unwrap_or("*"),
            self.day.as_deref().unwrap_or("*"),
            self.month.as_deref().unwrap_or("*"),
            self.day_of_week.as_deref().unwrap_or("*"),
        )
    }
}

/// Component durations for an interval trigger; fields are summed.
#[derive(Debug, Clone, Default)]
pub struct IntervalSpec {
    pub weeks: i64,
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
    /// Fire times computed before this instant are advanced to it.
    pub start_date: Option<DateTime<Utc>>,
    /// Fire times computed after this instant end the schedule.
    pub end_date: Option<DateTime<Utc>>,
}

/// Fixed-period trigger with optional bounds.
#[derive(Debug, Clone)]
pub struct IntervalTrigger {
    period: Duration,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
}

impl IntervalTrigger {
    fn new(spec: IntervalSpec) -> Result<Self, SchedulerError> {
        let period = Duration::weeks(spec.weeks)
            + Duration::days(spec.days)
            + Duration::hours(spec.hours)
            + Duration::minutes(spec.minutes)
            + Duration::seconds(spec.seconds);

        if period <= Duration::zero() {
            return Err(SchedulerError::InvalidDefinition(
                "interval period must be positive".to_string(),
            ));
        }

        Ok(Self {
            period,
            start_date: spec.start_date,
            end_date: spec.end_date,
        })
    }

    /// The summed period.
    pub fn period(&self) -> Duration {
        self.period
    }

    fn next_fire_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut next = after + self.period;
        if let Some(start) = self.start_date {
            if next < start {
                next = start;
            }
        }
        match self.end_date {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }
}

/// One-shot trigger at an absolute instant.
#[derive(Debug, Clone)]
pub struct DateTrigger {
    run_date: DateTime<Utc>,
}

impl DateTrigger {
    fn parse(run_date: &str, timezone: Option<Tz>) -> Result<Self, SchedulerError> {
        if run_date.trim().is_empty() {
            return Err(SchedulerError::InvalidDefinition(
                "run_date is required".to_string(),
            ));
        }

        // Absolute timestamps carry their own offset; naive timestamps are
        // interpreted in the supplied timezone, else UTC.
        if let Ok(absolute) = DateTime::parse_from_rfc3339(run_date) {
            return Ok(Self {
                run_date: absolute.with_timezone(&Utc),
            });
        }

        let naive = NaiveDateTime::parse_from_str(run_date, "%Y-%m-%d %H:%M:%S")
            .or_else(|_| NaiveDateTime::parse_from_str(run_date, "%Y-%m-%dT%H:%M:%S"))
            .map_err(|e| {
                SchedulerError::InvalidDefinition(format!("unparsable run_date {run_date:?}: {e}"))
            })?;

        let run_date = match timezone {
            Some(tz) => tz
                .from_local_datetime(&naive)
                .earliest()
                .ok_or_else(|| {
                    SchedulerError::InvalidDefinition(format!(
                        "run_date {run_date:?} does not exist in timezone {tz}"
                    ))
                })?
                .with_timezone(&Utc),
            None => Utc.from_utc_datetime(&naive),
        };

        Ok(Self { run_date })
    }

    /// The single instant this trigger fires at.
    pub fn run_date(&self) -> DateTime<Utc> {
        self.run_date
    }

    fn next_fire_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (self.run_date > after).then_some(self.run_date)
    }
}

fn parse_timezone(timezone: &str) -> Result<Tz, SchedulerError> {
    timezone
        .parse()
        .map_err(|_| SchedulerError::InvalidTimezone(timezone.to_string()))
}
