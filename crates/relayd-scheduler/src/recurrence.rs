//! Timezone-aware cron evaluation.
//!
//! Expressions use the `cron` crate grammar (seconds first). Classic
//! 5-field expressions are accepted and rewritten with a leading `0`
//! seconds field; their day-of-week field is translated to day names so
//! that `0` and `7` both mean Sunday.
//!
//! Occurrences are generated on the naive local clock and then resolved in
//! the timezone. A time repeated by a fall-back transition runs at its first
//! instant; a time skipped by a spring-forward gap runs shifted forward by
//! the gap.

use std::str::FromStr;

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::{Result, ScheduleError};

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Parse an IANA timezone name such as `Europe/Berlin`.
pub fn parse_timezone(timezone: &str) -> Result<Tz> {
    let name = timezone.trim();
    if name.is_empty() {
        return Err(ScheduleError::InvalidTimezone("timezone is required".into()));
    }
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

/// Rewrite an expression into the 6/7-field form the parser expects.
pub fn normalize_cron_expression(expression: &str) -> Result<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let day_of_week = translate_day_of_week(fields[4])?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], day_of_week
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(ScheduleError::InvalidCron(format!(
            "expected 5, 6 or 7 fields, got {} in '{}'",
            n,
            expression.trim()
        ))),
    }
}

/// Parse (after normalisation) into a reusable schedule.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let normalized = normalize_cron_expression(expression)?;
    Schedule::from_str(&normalized)
        .map_err(|e| ScheduleError::InvalidCron(format!("'{}': {}", expression.trim(), e)))
}

/// First occurrence strictly after `after`, evaluated on the local
/// wall clock of `timezone`.
pub fn compute_next_run_at(
    cron_expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let tz = parse_timezone(timezone)?;
    let schedule = parse_cron(cron_expr)?;
    next_after(&schedule, tz, after).ok_or_else(|| no_occurrence(cron_expr))
}

/// The next `count` occurrences after `from`.
pub fn preview_next_runs(
    cron_expr: &str,
    timezone: &str,
    from: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let tz = parse_timezone(timezone)?;
    let schedule = parse_cron(cron_expr)?;
    let runs: Vec<_> = occurrences(&schedule, tz, from).take(count).collect();
    if runs.is_empty() && count > 0 {
        return Err(no_occurrence(cron_expr));
    }
    Ok(runs)
}

/// Cursor advance after a slot: the next occurrence at least one second
/// past `planned_at`.
pub fn next_slot_after(
    cron_expr: &str,
    timezone: &str,
    planned_at: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    compute_next_run_at(cron_expr, timezone, planned_at + Duration::seconds(1))
}

fn next_after(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    occurrences(schedule, tz, after).next()
}

/// Strictly increasing instants after `after`.
///
/// The cron iterator runs over a `Utc` clock standing in for the naive
/// local wall clock of `tz`.
fn occurrences(
    schedule: &Schedule,
    tz: Tz,
    after: DateTime<Utc>,
) -> impl Iterator<Item = DateTime<Utc>> + '_ {
    let wall_start = Utc.from_utc_datetime(&after.with_timezone(&tz).naive_local());
    let mut last = after;
    schedule.after(&wall_start).filter_map(move |wall| {
        let at = resolve_local(tz, wall.naive_utc(), last)?;
        last = at;
        Some(at)
    })
}

/// The first instant after `after` that shows `local` on the wall clock.
fn resolve_local(tz: Tz, local: NaiveDateTime, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let resolved = match tz.from_local_datetime(&local) {
        LocalResult::Single(at) => Some(at.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, latest) => [earliest, latest]
            .into_iter()
            .map(|at| at.with_timezone(&Utc))
            .find(|at| *at > after),
        LocalResult::None => {
            // In a gap: read the time with the offset in force before it.
            let before = tz.from_local_datetime(&(local - Duration::days(1))).earliest()?;
            let offset = i64::from(before.offset().fix().local_minus_utc());
            Some(Utc.from_utc_datetime(&(local - Duration::seconds(offset))))
        }
    };
    resolved.filter(|at| *at > after)
}

fn no_occurrence(cron_expr: &str) -> ScheduleError {
    ScheduleError::InvalidCron(format!("'{}' has no upcoming occurrence", cron_expr.trim()))
}

/// Translate a numeric day-of-week field (0-7, Sunday = 0 or 7) into names.
fn translate_day_of_week(field: &str) -> Result<String> {
    if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(field.to_string());
    }

    let invalid = || ScheduleError::InvalidCron(format!("invalid day-of-week field '{}'", field));
    let day = |s: &str| -> Result<u32> {
        s.parse::<u32>()
            .ok()
            .filter(|d| *d <= 7)
            .ok_or_else(invalid)
    };

    let mut days = [false; 7];
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step = step.parse::<u32>().ok().filter(|s| *s > 0).ok_or_else(invalid)?;
                (base, step)
            }
            None => (item, 1),
        };
        let (start, end) = if base == "*" {
            (0, 6)
        } else if let Some((a, b)) = base.split_once('-') {
            let (a, b) = (day(a)?, day(b)?);
            let b = if b == 0 && a > 0 { 7 } else { b };
            if a > b {
                return Err(invalid());
            }
            (a, b)
        } else {
            let a = day(base)?;
            // `5/2` runs from 5 to the end of the week
            if item.contains('/') {
                (a, 6)
            } else {
                (a, a)
            }
        };
        let mut d = start;
        while d <= end {
            days[(d % 7) as usize] = true;
            d += step;
        }
    }

    if days.iter().all(|d| *d) {
        return Ok("*".to_string());
    }
    Ok(days
        .iter()
        .zip(DAY_NAMES)
        .filter(|(set, _)| **set)
        .map(|(_, name)| name)
        .collect::<Vec<_>>()
        .join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_five_fields_get_seconds() {
        assert_eq!(normalize_cron_expression("0 8 * * *").unwrap(), "0 0 8 * * *");
        assert_eq!(
            normalize_cron_expression("0 0 8 * * * 2030").unwrap(),
            "0 0 8 * * * 2030"
        );
        assert!(matches!(
            normalize_cron_expression("* * *"),
            Err(ScheduleError::InvalidCron(_))
        ));
    }

    #[test]
    fn test_day_of_week_translation() {
        assert_eq!(translate_day_of_week("1-5").unwrap(), "Mon,Tue,Wed,Thu,Fri");
        assert_eq!(translate_day_of_week("0").unwrap(), "Sun");
        assert_eq!(translate_day_of_week("7").unwrap(), "Sun");
        assert_eq!(translate_day_of_week("5-0").unwrap(), "Sun,Fri,Sat");
        assert_eq!(translate_day_of_week("0-7").unwrap(), "*");
        assert_eq!(translate_day_of_week("*/2").unwrap(), "Sun,Tue,Thu,Sat");
        assert_eq!(translate_day_of_week("MON-FRI").unwrap(), "MON-FRI");
        assert!(translate_day_of_week("8").is_err());
        assert!(translate_day_of_week("1/0").is_err());
    }

    #[test]
    fn test_weekday_expression_skips_weekend() {
        // 2025-06-07 is a Saturday.
        let from = Utc.with_ymd_and_hms(2025, 6, 7, 0, 0, 0).unwrap();
        let next = compute_next_run_at("30 7 * * 1-5", "UTC", from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 9, 7, 30, 0).unwrap());
    }

    #[test]
    fn test_local_hour_survives_spring_forward() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let from = Utc.with_ymd_and_hms(2025, 3, 8, 12, 30, 0).unwrap();

        let first = compute_next_run_at("0 8 * * *", "America/New_York", from).unwrap();
        assert_eq!(first, Utc.with_ymd_and_hms(2025, 3, 8, 13, 0, 0).unwrap());

        let second = next_slot_after("0 8 * * *", "America/New_York", first).unwrap();
        assert_eq!(second, Utc.with_ymd_and_hms(2025, 3, 9, 12, 0, 0).unwrap());

        let third = next_slot_after("0 8 * * *", "America/New_York", second).unwrap();
        assert_eq!(third, Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap());

        for at in [first, second, third] {
            assert_eq!(at.with_timezone(&tz).hour(), 8);
        }
    }

    #[test]
    fn test_repeated_hour_runs_once_at_first_instant() {
        // 2025-11-02 01:00-02:00 happens twice in New York.
        let from = Utc.with_ymd_and_hms(2025, 11, 2, 4, 0, 0).unwrap();
        let first = compute_next_run_at("30 1 * * *", "America/New_York", from).unwrap();
        assert_eq!(first, Utc.with_ymd_and_hms(2025, 11, 2, 5, 30, 0).unwrap());

        let second = next_slot_after("30 1 * * *", "America/New_York", first).unwrap();
        assert_eq!(second, Utc.with_ymd_and_hms(2025, 11, 3, 6, 30, 0).unwrap());

        // Created during the second 01:xx, the later 01:30 is still ahead.
        let late = Utc.with_ymd_and_hms(2025, 11, 2, 6, 10, 0).unwrap();
        let next = compute_next_run_at("30 1 * * *", "America/New_York", late).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 11, 2, 6, 30, 0).unwrap());
    }

    #[test]
    fn test_skipped_hour_shifts_forward() {
        // 2025-03-09 02:30 does not exist in New York; it runs at 03:30 EDT.
        let tz: Tz = "America/New_York".parse().unwrap();
        let from = Utc.with_ymd_and_hms(2025, 3, 9, 0, 0, 0).unwrap();
        let shifted = compute_next_run_at("30 2 * * *", "America/New_York", from).unwrap();
        assert_eq!(shifted, Utc.with_ymd_and_hms(2025, 3, 9, 7, 30, 0).unwrap());
        assert_eq!(shifted.with_timezone(&tz).hour(), 3);

        let next = next_slot_after("30 2 * * *", "America/New_York", shifted).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 10, 6, 30, 0).unwrap());
    }

    #[test]
    fn test_preview_across_fall_back() {
        let from = Utc.with_ymd_and_hms(2025, 11, 1, 12, 0, 0).unwrap();
        let runs = preview_next_runs("30 1 * * *", "America/New_York", from, 3).unwrap();
        assert_eq!(
            runs,
            vec![
                Utc.with_ymd_and_hms(2025, 11, 2, 5, 30, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 11, 3, 6, 30, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 11, 4, 6, 30, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn test_next_is_strictly_after() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let next = compute_next_run_at("0 0 10 * * *", "UTC", at).unwrap();
        assert_eq!(next, at + Duration::days(1));
    }

    #[test]
    fn test_preview() {
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let runs = preview_next_runs("*/15 * * * *", "Asia/Tokyo", from, 4).unwrap();
        assert_eq!(runs.len(), 4);
        assert_eq!(runs[0], Utc.with_ymd_and_hms(2025, 1, 1, 0, 15, 0).unwrap());
        assert_eq!(runs[3] - runs[0], Duration::minutes(45));
    }

    #[test]
    fn test_rejects_bad_input() {
        let now = Utc::now();
        assert!(matches!(
            compute_next_run_at("0 8 * * *", "Mars/Olympus", now),
            Err(ScheduleError::InvalidTimezone(_))
        ));
        assert!(matches!(
            compute_next_run_at("not a cron", "UTC", now),
            Err(ScheduleError::InvalidCron(_))
        ));
        // Only occurrences in a past year.
        assert!(matches!(
            compute_next_run_at("0 0 0 1 1 * 2001", "UTC", now),
            Err(ScheduleError::InvalidCron(_))
        ));
    }
}
