use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use cron::{Schedule, TimeUnitSpec};

use crate::error::{Result, SchedulerError};

/// Last year a schedule may resolve to; searches stop here.
pub const MAX_YEAR: i32 = 2099;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron expression.
///
/// Three layouts are accepted:
///
/// | Fields | Layout                                | Day-of-week numbering |
/// |--------|---------------------------------------|-----------------------|
/// | 5      | `min hour dom month dow`              | 0–7, 0 and 7 = Sunday |
/// | 6      | `sec min hour dom month dow`          | 1–7, 1 = Sunday       |
/// | 7      | `sec min hour dom month dow year`     | 1–7, 1 = Sunday       |
///
/// Fields are parsed by [`cron::Schedule`]. Day-of-month and day-of-week
/// combine with OR when both are restricted, so matching is done here
/// rather than with [`Schedule::after`], which requires both.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: Schedule,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse `expression`, returning `InvalidSchedule` on any syntax or range error.
    pub fn parse(expression: &str) -> Result<Self> {
        let normalized = normalize_cron(expression)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| invalid(expression, e))?;
        Ok(Self {
            dom_restricted: !schedule.days_of_month().is_all(),
            dow_restricted: !schedule.days_of_week().is_all(),
            schedule,
        })
    }

    /// Earliest matching instant strictly after `after`, or `None` when the
    /// schedule has no occurrence before the end of [`MAX_YEAR`].
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let s = &self.schedule;
        let mut t = after.with_nanosecond(0)? + Duration::seconds(1);

        loop {
            if t.year() > MAX_YEAR {
                return None;
            }

            if !s.years().includes(t.year() as u32) {
                t = Utc.with_ymd_and_hms(t.year() + 1, 1, 1, 0, 0, 0).single()?;
                continue;
            }

            if !s.months().includes(t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }

            if !self.day_matches(t) {
                t = start_of_next_day(t)?;
                continue;
            }

            if !s.hours().includes(t.hour()) {
                t = t.with_minute(0)?.with_second(0)? + Duration::hours(1);
                continue;
            }

            if !s.minutes().includes(t.minute()) {
                t = t.with_second(0)? + Duration::minutes(1);
                continue;
            }

            match (t.second()..60).find(|sec| s.seconds().includes(*sec)) {
                Some(sec) => return t.with_second(sec),
                None => {
                    t = t.with_second(0)? + Duration::minutes(1);
                }
            }
        }
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.schedule.days_of_month().includes(t.day());
        let dow = self
            .schedule
            .days_of_week()
            .includes(t.weekday().number_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl FromStr for CronSchedule {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Compute the next fire time for `schedule` strictly after `after`.
///
/// Returns `None` when the schedule is exhausted (e.g. a year-bound
/// expression whose last year has passed).
pub fn next_fire_time(schedule: &CronSchedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.next_after(after)
}

/// Bring `expression` into the 6/7-field form `cron::Schedule` parses.
///
/// A 5-field expression gets a `0` seconds field and its day-of-week field
/// renumbered. `?` becomes `*` in the day fields.
fn normalize_cron(expression: &str) -> Result<String> {
    let upper = expression.trim().to_ascii_uppercase();
    let mut fields: Vec<String> = upper.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => {
            fields[4] = unix_days_of_week(expression, &fields[4])?;
            fields.insert(0, "0".to_string());
        }
        6 | 7 => {}
        n => {
            return Err(invalid(
                expression,
                format!("expected 5, 6 or 7 fields, found {n}"),
            ))
        }
    }

    for (i, field) in fields.iter_mut().enumerate() {
        if uses_quartz_extensions(field) {
            return Err(invalid(expression, "L, W and # are not supported"));
        }
        if field.contains('?') {
            // dom and dow only
            if field != "?" || !(i == 3 || i == 5) {
                return Err(invalid(expression, "'?' is only allowed as a whole day field"));
            }
            *field = "*".to_string();
        }
    }
    Ok(fields.join(" "))
}

fn uses_quartz_extensions(field: &str) -> bool {
    field.contains('#')
        || field.split([',', '-', '/']).any(|token| {
            token == "L"
                || token == "LW"
                || (token.len() > 1
                    && token.ends_with(['L', 'W'])
                    && token[..token.len() - 1].chars().all(|c| c.is_ascii_digit()))
        })
}

/// Rewrite a Unix day-of-week field (0–7, 0 and 7 = Sunday) as the list of
/// 1–7 ordinals `cron` uses (1 = Sunday).
fn unix_days_of_week(expression: &str, field: &str) -> Result<String> {
    if field == "*" || field == "?" || uses_quartz_extensions(field) {
        return Ok(field.to_string());
    }
    let mut days = BTreeSet::new();
    for part in field.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let step = step
                    .parse::<usize>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| {
                        invalid(expression, format!("bad step '{step}' in day-of-week field"))
                    })?;
                (base, Some(step))
            }
            None => (part, None),
        };
        let (start, end) = if base == "*" {
            (0, 6)
        } else if let Some((lo, hi)) = base.split_once('-') {
            (unix_day(expression, lo)?, unix_day(expression, hi)?)
        } else {
            let day = unix_day(expression, base)?;
            // `d/s` runs to the end of the week
            if step.is_some() {
                (day, 7)
            } else {
                (day, day)
            }
        };
        if start > end {
            return Err(invalid(
                expression,
                format!("range {start}-{end} is reversed in day-of-week field"),
            ));
        }
        days.extend((start..=end).step_by(step.unwrap_or(1)).map(|d| d % 7 + 1));
    }
    Ok(days
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

fn unix_day(expression: &str, text: &str) -> Result<u32> {
    if let Some(i) = DAY_NAMES.iter().position(|name| *name == text) {
        return Ok(i as u32);
    }
    text.parse::<u32>()
        .ok()
        .filter(|d| *d <= 7)
        .ok_or_else(|| invalid(expression, format!("unsupported day-of-week '{text}'")))
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

fn start_of_next_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let date = t.date_naive().succ_opt()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

fn invalid(expression: &str, reason: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::InvalidSchedule(format!("'{expression}': {reason}"))
}
