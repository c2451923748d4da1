//! Cron expression adapter over the `cron` crate
//!
//! Accepts 5-field Unix expressions (minute granularity, day-of-week 0-7 with
//! 0 and 7 both Sunday) as well as the crate's native 6/7-field form with a
//! leading seconds field.
//!
//! Unix cron matches a day when *either* a restricted day-of-month or a
//! restricted day-of-week matches, while the underlying evaluator requires
//! both. A 5-field expression restricting both fields is therefore rejected
//! instead of silently firing less often. The native forms use the
//! evaluator's semantics as-is.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, DurationRound, Utc};
use cron::Schedule;
use thiserror::Error;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("cron expression '{expression}' has {found} fields, expected 5, 6 or 7")]
    FieldCount { expression: String, found: usize },

    #[error("invalid cron expression '{expression}': {reason}")]
    Invalid { expression: String, reason: String },
}

/// A parsed, evaluable cron expression
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => {
                if is_restricted(fields[2]) && is_restricted(fields[4]) {
                    return Err(CronError::Invalid {
                        expression: expression.to_string(),
                        reason: "day-of-month and day-of-week cannot both be restricted".to_string(),
                    });
                }
                let day_of_week = unix_day_of_week(fields[4]).map_err(|reason| CronError::Invalid {
                    expression: expression.to_string(),
                    reason,
                })?;
                format!(
                    "0 {} {} {} {} {}",
                    fields[0], fields[1], fields[2], fields[3], day_of_week
                )
            }
            6 | 7 => fields.join(" "),
            found => {
                return Err(CronError::FieldCount {
                    expression: expression.to_string(),
                    found,
                })
            }
        };

        let schedule = Schedule::from_str(&normalized).map_err(|e| CronError::Invalid {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether the schedule has an occurrence inside the minute containing `at`
    pub fn is_due(&self, at: DateTime<Utc>) -> bool {
        let minute = truncate_to_minute(at);
        // `after` is exclusive, so step back one second to include the minute start
        match self.schedule.after(&(minute - Duration::seconds(1))).next() {
            Some(next) => next < minute + Duration::minutes(1),
            None => false,
        }
    }

    /// First occurrence strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}

pub fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(Duration::minutes(1)).unwrap_or(at)
}

fn is_restricted(field: &str) -> bool {
    field != "*" && field != "?"
}

/// Rewrite a Unix day-of-week field into day names so numbering cannot drift
fn unix_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days: Vec<String> = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}' in day-of-week", step))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (base, step)
            }
            None => (item, 1),
        };

        // Names are passed through untouched
        if base.chars().any(|c| c.is_ascii_alphabetic()) {
            days.push(item.to_string());
            continue;
        }

        let (start, end) = match base {
            "*" => (0, 6),
            _ => match base.split_once('-') {
                Some((start, end)) => (parse_day(start)?, parse_day(end)?),
                None if step > 1 => (parse_day(base)?, 6),
                None => {
                    let day = parse_day(base)?;
                    (day, day)
                }
            },
        };
        if start > end {
            return Err(format!("day-of-week range '{}' is reversed", base));
        }
        // 7 is Sunday too; `day % 7` folds it onto 0
        for day in (start..=end).step_by(step) {
            days.push(DAY_NAMES[day % 7].to_string());
        }
    }

    days.sort_by_key(|day| DAY_NAMES.iter().position(|name| name == day));
    days.dedup();
    Ok(days.join(","))
}

fn parse_day(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("day-of-week value '{}' out of range 0-7", value)),
    }
}
