// Schedule parsing and fire time calculation
//
// Computes successive fire times for the schedule kinds a trigger can carry
// (simple interval and cron), skipping instants excluded by a calendar.

use crate::calendar::Calendar;
use crate::errors::ScheduleError;
use crate::models::{Schedule, Trigger};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Upper bound on candidate fire times rejected by a calendar before giving up
const MAX_CALENDAR_SKIPS: usize = 10_000;

/// Parse and validate a cron expression (seconds field required)
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(expression).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Reject schedule payloads that cannot produce fire times
pub fn validate_schedule(schedule: &Schedule) -> Result<(), ScheduleError> {
    match schedule {
        Schedule::Simple {
            repeat_interval_ms,
            repeat_count,
        } => {
            if *repeat_interval_ms < 0 {
                return Err(ScheduleError::InvalidInterval(format!(
                    "repeat interval must not be negative, got {}ms",
                    repeat_interval_ms
                )));
            }
            if *repeat_count < -1 {
                return Err(ScheduleError::InvalidConfiguration(format!(
                    "repeat count must be -1 or greater, got {}",
                    repeat_count
                )));
            }
            if *repeat_count != 0 && *repeat_interval_ms == 0 {
                return Err(ScheduleError::InvalidInterval(
                    "repeating schedule needs a positive interval".to_string(),
                ));
            }
            Ok(())
        }
        Schedule::Cron { expression, .. } => parse_cron_expression(expression).map(|_| ()),
    }
}

/// First schedule instant strictly after `after`, ignoring calendars
pub fn fire_time_after(
    schedule: &Schedule,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let next = match schedule {
        Schedule::Simple {
            repeat_interval_ms,
            repeat_count,
        } => simple_fire_time_after(*repeat_interval_ms, *repeat_count, start_time, after),
        Schedule::Cron {
            expression,
            timezone,
        } => {
            let cron = parse_cron_expression(expression)?;
            let floor = start_time - Duration::milliseconds(1);
            let reference = if after < floor { floor } else { after };
            cron.after(&reference.with_timezone(timezone))
                .next()
                .map(|t| t.with_timezone(&Utc))
        }
    };

    Ok(next.filter(|t| end_time.map_or(true, |end| *t <= end)))
}

fn simple_fire_time_after(
    interval_ms: i64,
    repeat_count: i32,
    start_time: DateTime<Utc>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if after < start_time {
        return Some(start_time);
    }
    if interval_ms <= 0 || repeat_count == 0 {
        return None;
    }

    let elapsed = (after - start_time).num_milliseconds();
    let n = elapsed / interval_ms + 1;
    if repeat_count >= 0 && n > i64::from(repeat_count) {
        return None;
    }

    n.checked_mul(interval_ms)
        .and_then(|offset| start_time.checked_add_signed(Duration::milliseconds(offset)))
}

/// Next fire time of `trigger` strictly after `after`, honouring its calendar
pub fn next_fire_time_after(
    trigger: &Trigger,
    calendar: Option<&Calendar>,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let mut cursor = after;
    for _ in 0..MAX_CALENDAR_SKIPS {
        let candidate =
            match fire_time_after(&trigger.schedule, trigger.start_time, trigger.end_time, cursor)? {
                Some(t) => t,
                None => return Ok(None),
            };
        match calendar {
            Some(cal) if !cal.is_time_included(candidate) => cursor = candidate,
            _ => return Ok(Some(candidate)),
        }
    }

    tracing::warn!(
        trigger = %trigger.key,
        "Calendar excluded every candidate fire time, trigger will not fire again"
    );
    Ok(None)
}

/// First fire time of a freshly stored trigger
pub fn first_fire_time(
    trigger: &Trigger,
    calendar: Option<&Calendar>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    next_fire_time_after(
        trigger,
        calendar,
        trigger.start_time - Duration::milliseconds(1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::CalendarRule;
    use crate::models::{JobKey, TriggerKey};
    use chrono::{TimeZone, Weekday};

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    fn trigger(schedule: Schedule, start: DateTime<Utc>) -> Trigger {
        Trigger::new(
            TriggerKey::in_default_group("t"),
            JobKey::in_default_group("j"),
            schedule,
        )
        .starting_at(start)
    }

    #[test]
    fn test_parse_valid_cron_expression() {
        assert!(parse_cron_expression("0 0 12 * * *").is_ok());
    }

    #[test]
    fn test_parse_invalid_cron_expression() {
        assert!(parse_cron_expression("invalid").is_err());
    }

    #[test]
    fn test_validate_schedule() {
        assert!(validate_schedule(&Schedule::once()).is_ok());
        assert!(validate_schedule(&Schedule::every(Duration::seconds(10))).is_ok());
        assert!(validate_schedule(&Schedule::Simple {
            repeat_interval_ms: 0,
            repeat_count: 3
        })
        .is_err());
        assert!(validate_schedule(&Schedule::Simple {
            repeat_interval_ms: -5,
            repeat_count: 0
        })
        .is_err());
        assert!(validate_schedule(&Schedule::cron("bad", chrono_tz::UTC)).is_err());
    }

    #[test]
    fn test_one_shot_fires_once() {
        let start = utc(2024, 6, 3, 9, 0, 0);
        let t = trigger(Schedule::once(), start);
        assert_eq!(first_fire_time(&t, None).unwrap(), Some(start));
        assert_eq!(next_fire_time_after(&t, None, start).unwrap(), None);
    }

    #[test]
    fn test_simple_repeat_count_is_honoured() {
        let start = utc(2024, 6, 3, 9, 0, 0);
        let t = trigger(
            Schedule::Simple {
                repeat_interval_ms: 60_000,
                repeat_count: 2,
            },
            start,
        );
        let second = next_fire_time_after(&t, None, start).unwrap().unwrap();
        assert_eq!(second, utc(2024, 6, 3, 9, 1, 0));
        let third = next_fire_time_after(&t, None, second).unwrap().unwrap();
        assert_eq!(third, utc(2024, 6, 3, 9, 2, 0));
        assert_eq!(next_fire_time_after(&t, None, third).unwrap(), None);
    }

    #[test]
    fn test_simple_after_arbitrary_instant() {
        let start = utc(2024, 6, 3, 9, 0, 0);
        let t = trigger(Schedule::every(Duration::minutes(10)), start);
        let next = next_fire_time_after(&t, None, utc(2024, 6, 3, 9, 25, 13))
            .unwrap()
            .unwrap();
        assert_eq!(next, utc(2024, 6, 3, 9, 30, 0));
    }

    #[test]
    fn test_end_time_stops_schedule() {
        let start = utc(2024, 6, 3, 9, 0, 0);
        let t = trigger(Schedule::every(Duration::minutes(10)), start)
            .ending_at(utc(2024, 6, 3, 9, 15, 0));
        assert_eq!(
            next_fire_time_after(&t, None, start).unwrap(),
            Some(utc(2024, 6, 3, 9, 10, 0))
        );
        assert_eq!(
            next_fire_time_after(&t, None, utc(2024, 6, 3, 9, 10, 0)).unwrap(),
            None
        );
    }

    #[test]
    fn test_cron_next_in_timezone() {
        let start = utc(2024, 6, 1, 0, 0, 0);
        let t = trigger(
            Schedule::cron("0 0 12 * * *", chrono_tz::Asia::Ho_Chi_Minh),
            start,
        );
        // noon in UTC+7 is 05:00 UTC
        let next = next_fire_time_after(&t, None, utc(2024, 6, 3, 1, 0, 0))
            .unwrap()
            .unwrap();
        assert_eq!(next, utc(2024, 6, 3, 5, 0, 0));
    }

    #[test]
    fn test_cron_first_fire_not_before_start() {
        let start = utc(2024, 6, 3, 12, 0, 0);
        let t = trigger(Schedule::cron("0 0 12 * * *", chrono_tz::UTC), start);
        assert_eq!(first_fire_time(&t, None).unwrap(), Some(start));
    }

    #[test]
    fn test_calendar_skips_excluded_days() {
        // 2024-06-01 is a Saturday
        let start = utc(2024, 6, 1, 9, 0, 0);
        let t = trigger(Schedule::every(Duration::days(1)), start);
        let cal = Calendar::new(
            "weekdays",
            chrono_tz::UTC,
            CalendarRule::Weekly {
                excluded_days: vec![Weekday::Sat, Weekday::Sun],
            },
        );
        assert_eq!(
            first_fire_time(&t, Some(&cal)).unwrap(),
            Some(utc(2024, 6, 3, 9, 0, 0))
        );
    }
}
