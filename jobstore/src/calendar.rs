// Calendars exclude instants from trigger schedules

use crate::errors::ScheduleError;
use crate::schedule::parse_cron_expression;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Exclusion rule payload, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalendarRule {
    /// Whole calendar dates are excluded
    Holiday { excluded_dates: BTreeSet<NaiveDate> },
    /// Whole weekdays are excluded
    Weekly { excluded_days: Vec<Weekday> },
    /// Times of day inside `[range_start, range_end)` are excluded; inverted, only they are included
    Daily {
        range_start: NaiveTime,
        range_end: NaiveTime,
        #[serde(default)]
        invert: bool,
    },
    /// Instants matched by the cron expression (second precision) are excluded
    Cron { expression: String },
}

/// Stored calendar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub timezone: Tz,
    pub rule: CalendarRule,
}

impl Calendar {
    pub fn new(name: impl Into<String>, timezone: Tz, rule: CalendarRule) -> Self {
        Self {
            name: name.into(),
            description: None,
            timezone,
            rule,
        }
    }

    /// Reject rules that can never be evaluated
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match &self.rule {
            CalendarRule::Cron { expression } => parse_cron_expression(expression).map(|_| ()),
            CalendarRule::Daily {
                range_start,
                range_end,
                ..
            } if range_start >= range_end => Err(ScheduleError::InvalidConfiguration(format!(
                "daily calendar '{}' range start must precede range end",
                self.name
            ))),
            CalendarRule::Weekly { excluded_days } if excluded_days.len() >= 7 => {
                Err(ScheduleError::InvalidConfiguration(format!(
                    "weekly calendar '{}' excludes every day",
                    self.name
                )))
            }
            _ => Ok(()),
        }
    }

    /// Whether a trigger may fire at `time`
    pub fn is_time_included(&self, time: DateTime<Utc>) -> bool {
        let local = time.with_timezone(&self.timezone);
        match &self.rule {
            CalendarRule::Holiday { excluded_dates } => {
                !excluded_dates.contains(&local.date_naive())
            }
            CalendarRule::Weekly { excluded_days } => {
                !excluded_days.contains(&chrono::Datelike::weekday(&local))
            }
            CalendarRule::Daily {
                range_start,
                range_end,
                invert,
            } => {
                let t = local.time();
                let inside = t >= *range_start && t < *range_end;
                inside == *invert
            }
            CalendarRule::Cron { expression } => match parse_cron_expression(expression) {
                Ok(schedule) => {
                    let truncated = local.with_nanosecond(0).unwrap_or(local);
                    let probe = truncated - Duration::seconds(1);
                    schedule.after(&probe).next() != Some(truncated)
                }
                // validated on store; an unreadable rule excludes nothing
                Err(_) => true,
            },
        }
    }
}
