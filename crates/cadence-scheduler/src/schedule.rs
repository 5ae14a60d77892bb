use std::str::FromStr;

use chrono::{DateTime, Duration, SubsecRound, Utc};

use crate::error::ScheduleError;

/// Upper bound on how many missed occurrences a single pass will walk.
pub const MAX_MISSED_RUNS: usize = 100;

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed schedule expression.
///
/// Accepted forms:
///
/// | Form                 | Example          |
/// |----------------------|------------------|
/// | 5-field cron         | `*/15 9-17 * * 1-5` |
/// | Descriptor           | `@hourly`, `@daily`, `@weekly`, `@monthly`, `@yearly` |
/// | Fixed interval       | `@every 1h30m`   |
///
/// Day-of-week follows classic cron numbering (0 = Sunday). All times are UTC.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    kind: Kind,
}

#[derive(Debug, Clone)]
enum Kind {
    Cron(Box<cron::Schedule>),
    /// Day-of-month and day-of-week both restricted: a day matching either
    /// one fires, as in classic cron.
    EitherDay {
        by_month_day: Box<cron::Schedule>,
        by_weekday: Box<cron::Schedule>,
    },
    Every(Duration),
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        let invalid = |reason: String| ScheduleError::InvalidSchedule {
            expression: expression.to_string(),
            reason,
        };

        if trimmed.is_empty() {
            return Err(invalid("expression is empty".to_string()));
        }

        let kind = if let Some(rest) = trimmed.strip_prefix("@every") {
            if !rest.starts_with(char::is_whitespace) {
                return Err(invalid(format!("unknown descriptor {trimmed:?}")));
            }
            Kind::Every(parse_interval(rest.trim()).map_err(invalid)?)
        } else if trimmed.starts_with('@') {
            let six = descriptor(trimmed).ok_or_else(|| {
                invalid(format!(
                    "unknown descriptor {trimmed:?}; expected @yearly, @monthly, @weekly, @daily, @hourly or @every <duration>"
                ))
            })?;
            Kind::Cron(Box::new(compile(six).map_err(invalid)?))
        } else {
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if fields.len() != 5 {
                return Err(invalid(format!(
                    "expected 5 fields (minute hour day-of-month month day-of-week), found {}",
                    fields.len()
                )));
            }
            let (minute, hour, month_day, month, weekday) =
                (fields[0], fields[1], fields[2], fields[3], fields[4]);
            let weekdays = normalize_weekdays(weekday).map_err(invalid)?;
            // the cron crate wants a leading seconds field
            let six = |dom: &str, dow: &str| format!("0 {minute} {hour} {dom} {month} {dow}");
            if is_unrestricted(month_day) || is_unrestricted(weekday) {
                Kind::Cron(Box::new(compile(&six(month_day, &weekdays)).map_err(invalid)?))
            } else {
                Kind::EitherDay {
                    by_month_day: Box::new(compile(&six(month_day, "*")).map_err(invalid)?),
                    by_weekday: Box::new(compile(&six("*", &weekdays)).map_err(invalid)?),
                }
            }
        };

        Ok(Self {
            expression: trimmed.to_string(),
            kind,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `t`, or `None` if the schedule never
    /// fires again.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            Kind::Cron(schedule) => schedule.after(&t).next(),
            Kind::EitherDay {
                by_month_day,
                by_weekday,
            } => match (by_month_day.after(&t).next(), by_weekday.after(&t).next()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            Kind::Every(delay) => t.trunc_subsecs(0).checked_add_signed(*delay),
        }
    }

    /// The next `count` occurrences after `from`.
    pub fn upcoming(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = from;
        while out.len() < count {
            match self.next_after(cursor) {
                Some(t) => {
                    out.push(t);
                    cursor = t;
                }
                None => break,
            }
        }
        out
    }
}

fn compile(six: &str) -> Result<cron::Schedule, String> {
    cron::Schedule::from_str(six).map_err(|e| e.to_string())
}

/// A day field left open (`*` or `?`, without a step above one). When
/// either day field is open the two are combined with AND, otherwise OR.
fn is_unrestricted(field: &str) -> bool {
    field.split(',').any(|item| {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let low = range.split('-').next().unwrap_or(range);
        (low == "*" || low == "?") && step.map_or(true, |step| step.trim() == "1")
    })
}

fn descriptor(name: &str) -> Option<&'static str> {
    // sec min hour day-of-month month day-of-week
    match name.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Some("0 0 0 1 1 *"),
        "@monthly" => Some("0 0 0 1 * *"),
        "@weekly" => Some("0 0 0 * * SUN"),
        "@daily" | "@midnight" => Some("0 0 0 * * *"),
        "@hourly" => Some("0 0 * * * *"),
        _ => None,
    }
}

/// Rewrite numeric weekdays (0 = Sunday) as names. The cron crate numbers
/// weekdays from 1 = Sunday, names mean the same thing in both.
fn normalize_weekdays(field: &str) -> Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let range = if range == "*" || range == "?" {
            range.to_string()
        } else {
            range
                .split('-')
                .map(weekday_name)
                .collect::<Result<Vec<_>, _>>()?
                .join("-")
        };
        items.push(match step {
            Some(step) => format!("{range}/{step}"),
            None => range,
        });
    }
    Ok(items.join(","))
}

fn weekday_name(token: &str) -> Result<String, String> {
    match token.parse::<usize>() {
        Ok(n) => WEEKDAYS
            .get(n)
            .map(|d| d.to_string())
            .ok_or_else(|| format!("day-of-week {n} out of range (0-6)")),
        Err(_) => Ok(token.to_ascii_uppercase()),
    }
}

/// Parse a Go-style duration such as `90s`, `15m` or `1h30m`.
///
/// Intervals below one second are raised to one second; sub-second
/// remainders are dropped.
fn parse_interval(input: &str) -> Result<Duration, String> {
    if input.is_empty() {
        return Err("@every requires a duration".to_string());
    }

    let mut total = Duration::zero();
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("invalid duration {input:?}"));
        }
        let value: i64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid duration {input:?}"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "h" => Duration::try_hours(value),
            "m" => Duration::try_minutes(value),
            "s" => Duration::try_seconds(value),
            "ms" => Duration::try_milliseconds(value),
            "" => return Err(format!("missing unit in duration {input:?}")),
            other => return Err(format!("unknown unit {other:?} in duration {input:?}")),
        }
        .ok_or_else(|| format!("duration {input:?} is too large"))?;
        total = total
            .checked_add(&part)
            .ok_or_else(|| format!("duration {input:?} is too large"))?;
        rest = &rest[unit_len..];
    }

    let whole = Duration::seconds(total.num_seconds()).max(Duration::seconds(1));
    if DateTime::<Utc>::default().checked_add_signed(whole).is_none() {
        return Err(format!("duration {input:?} is too large"));
    }
    Ok(whole)
}

/// Result of walking a schedule up to `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleTimes {
    /// Most recent occurrence at or before `now` that has not been launched.
    pub last_missed: Option<DateTime<Utc>>,
    /// First occurrence strictly after `now`.
    pub next: DateTime<Utc>,
}

impl ScheduleTimes {
    /// How long to wait before the next occurrence is due.
    pub fn requeue_after(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.next - now).to_std().unwrap_or_default()
    }
}

/// Find the latest missed occurrence and the next future one.
///
/// `earliest` is the last known scheduled time (or the schedule's creation
/// time). With a starting deadline, occurrences older than
/// `now - deadline` are never considered.
pub fn next_schedule(
    schedule: &CronSchedule,
    earliest: DateTime<Utc>,
    starting_deadline: Option<Duration>,
    now: DateTime<Utc>,
) -> Result<ScheduleTimes, ScheduleError> {
    let mut earliest = earliest;
    if let Some(deadline) = starting_deadline {
        // a deadline reaching past the start of time clamps nothing
        if let Some(scheduling_deadline) = now.checked_sub_signed(deadline) {
            if scheduling_deadline > earliest {
                earliest = scheduling_deadline;
            }
        }
    }

    let next = schedule
        .next_after(now)
        .ok_or_else(|| ScheduleError::InvalidSchedule {
            expression: schedule.expression().to_string(),
            reason: "schedule has no future occurrences".to_string(),
        })?;

    if earliest > now {
        return Ok(ScheduleTimes {
            last_missed: None,
            next,
        });
    }

    let mut last_missed = None;
    let mut starts = 0usize;
    let mut cursor = schedule.next_after(earliest);
    while let Some(t) = cursor {
        if t > now {
            break;
        }
        last_missed = Some(t);
        starts += 1;
        if starts > MAX_MISSED_RUNS {
            return Err(ScheduleError::TooManyMissedRuns {
                limit: MAX_MISSED_RUNS,
            });
        }
        cursor = schedule.next_after(t);
    }

    Ok(ScheduleTimes { last_missed, next })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expr in ["", "   ", "* * * *", "61 * * * *", "* * * * 9", "@fortnightly", "@every", "@every 5", "@everyday"] {
            let err = CronSchedule::parse(expr).unwrap_err();
            assert_eq!(err.code(), "INVALID_SCHEDULE", "{expr:?} should be invalid");
        }
    }

    #[test]
    fn every_minute_scenario() {
        // created at T, now T+125s, no history, no deadline
        let sched = CronSchedule::parse("*/1 * * * *").unwrap();
        let now = t0() + Duration::seconds(125);
        let times = next_schedule(&sched, t0(), None, now).unwrap();
        assert_eq!(times.last_missed, Some(t0() + Duration::seconds(120)));
        assert_eq!(times.next, t0() + Duration::seconds(180));
        assert_eq!(times.requeue_after(now), std::time::Duration::from_secs(55));
    }

    #[test]
    fn nothing_missed_when_earliest_is_recent() {
        let sched = CronSchedule::parse("0 * * * *").unwrap();
        let now = t0() + Duration::minutes(30);
        let times = next_schedule(&sched, t0(), None, now).unwrap();
        assert_eq!(times.last_missed, None);
        assert_eq!(times.next, t0() + Duration::hours(1));
    }

    #[test]
    fn earliest_in_future_returns_only_next() {
        let sched = CronSchedule::parse("*/5 * * * *").unwrap();
        let now = t0();
        let times = next_schedule(&sched, now + Duration::hours(2), None, now).unwrap();
        assert_eq!(times.last_missed, None);
        assert_eq!(times.next, t0() + Duration::minutes(5));
    }

    #[test]
    fn deadline_clamps_earliest_forward() {
        let sched = CronSchedule::parse("* * * * *").unwrap();
        // last run a year ago would be thousands of misses without the clamp
        let earliest = t0() - Duration::days(365);
        let now = t0() + Duration::seconds(30);
        let deadline = Duration::seconds(200);
        let times = next_schedule(&sched, earliest, Some(deadline), now).unwrap();
        let missed = times.last_missed.unwrap();
        assert_eq!(missed, t0());
        assert!(missed >= now - deadline);
    }

    #[test]
    fn too_many_missed_runs_is_an_error() {
        let sched = CronSchedule::parse("* * * * *").unwrap();
        let now = t0() + Duration::minutes(101);
        let err = next_schedule(&sched, t0(), None, now).unwrap_err();
        assert_eq!(err, ScheduleError::TooManyMissedRuns { limit: MAX_MISSED_RUNS });

        // exactly one hundred misses is still fine
        let now = t0() + Duration::minutes(100);
        let times = next_schedule(&sched, t0(), None, now).unwrap();
        assert_eq!(times.last_missed, Some(now));
    }

    #[test]
    fn missed_is_never_after_now_and_next_is_strictly_after() {
        let exprs = [
            "* * * * *",
            "*/7 * * * *",
            "0 */3 * * *",
            "30 2 * * 1-5",
            "0 0 1 * 1",
            "0 12 13 * 5",
            "@hourly",
            "@every 45s",
        ];
        let offsets = [0i64, 1, 59, 60, 61, 3599, 3600, 86_399];
        for expr in exprs {
            let sched = CronSchedule::parse(expr).unwrap();
            for offset in offsets {
                let now = t0() + Duration::seconds(offset);
                let earliest = now - Duration::minutes(90);
                let times = match next_schedule(&sched, earliest, None, now) {
                    Ok(times) => times,
                    Err(ScheduleError::TooManyMissedRuns { .. }) => continue,
                    Err(e) => panic!("{expr}: {e}"),
                };
                if let Some(missed) = times.last_missed {
                    assert!(missed <= now, "{expr} @ {offset}: missed {missed} > now {now}");
                    assert!(missed > earliest);
                }
                assert!(times.next > now, "{expr} @ {offset}: next {} <= now", times.next);
            }
        }
    }

    #[test]
    fn numeric_weekdays_use_sunday_zero() {
        // 2026-01-04 is a Sunday
        let sched = CronSchedule::parse("0 9 * * 0").unwrap();
        let next = sched.next_after(t0()).unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!(next.hour(), 9);

        let weekdays = CronSchedule::parse("0 9 * * 1-5").unwrap();
        for t in weekdays.upcoming(t0(), 10) {
            assert!(!matches!(t.weekday(), Weekday::Sat | Weekday::Sun), "{t}");
        }

        let named = CronSchedule::parse("0 9 * * mon,fri").unwrap();
        for t in named.upcoming(t0(), 6) {
            assert!(matches!(t.weekday(), Weekday::Mon | Weekday::Fri), "{t}");
        }
    }

    #[test]
    fn descriptors_expand() {
        let daily = CronSchedule::parse("@daily").unwrap();
        assert_eq!(daily.next_after(t0()), Some(t0() + Duration::days(1)));

        let midnight = CronSchedule::parse("@midnight").unwrap();
        assert_eq!(midnight.next_after(t0()), daily.next_after(t0()));

        let weekly = CronSchedule::parse("@weekly").unwrap();
        assert_eq!(weekly.next_after(t0()).unwrap().weekday(), Weekday::Sun);

        let yearly = CronSchedule::parse("@annually").unwrap();
        assert_eq!(
            yearly.next_after(t0()),
            Some(Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn every_interval_truncates_to_whole_seconds() {
        let sched = CronSchedule::parse("@every 1h30m").unwrap();
        let from = t0() + Duration::milliseconds(1500);
        assert_eq!(
            sched.next_after(from),
            Some(t0() + Duration::seconds(1) + Duration::minutes(90))
        );

        let tiny = CronSchedule::parse("@every 200ms").unwrap();
        assert_eq!(tiny.next_after(t0()), Some(t0() + Duration::seconds(1)));

        assert!(CronSchedule::parse("@every 10x").is_err());
        assert!(CronSchedule::parse("@every h").is_err());
    }

    #[test]
    fn impossible_date_has_no_future() {
        // February 30th never happens
        let sched = CronSchedule::parse("0 0 30 2 *").unwrap();
        let err = next_schedule(&sched, t0(), None, t0()).unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEDULE");
    }

    #[test]
    fn upcoming_lists_consecutive_runs() {
        let sched = CronSchedule::parse("15 * * * *").unwrap();
        let runs = sched.upcoming(t0(), 3);
        assert_eq!(
            runs,
            vec![
                t0() + Duration::minutes(15),
                t0() + Duration::minutes(75),
                t0() + Duration::minutes(135),
            ]
        );
    }

    #[test]
    fn both_day_fields_fire_on_either() {
        // the 1st of the month or any Monday
        let sched = CronSchedule::parse("0 0 1 * 1").unwrap();
        let day = |m, d| Utc.with_ymd_and_hms(2026, m, d, 0, 0, 0).unwrap();
        assert_eq!(sched.upcoming(t0(), 3), vec![day(1, 5), day(1, 12), day(1, 19)]);

        // Sunday Feb 1 fires through the month day
        assert_eq!(
            sched.upcoming(day(1, 20), 3),
            vec![day(1, 26), day(2, 1), day(2, 2)]
        );

        // Monday Jun 1 matches both fields but fires once
        assert_eq!(
            sched.upcoming(day(5, 31), 2),
            vec![day(6, 1), day(6, 8)]
        );
    }

    #[test]
    fn open_day_field_keeps_both_conditions() {
        // day-of-month open: only Mondays
        let mondays = CronSchedule::parse("0 0 * * 1").unwrap();
        for t in mondays.upcoming(t0(), 5) {
            assert_eq!(t.weekday(), Weekday::Mon, "{t}");
        }
        // a stepped star restricts the field
        assert!(!is_unrestricted("*/2"));
        assert!(is_unrestricted("*"));
        assert!(is_unrestricted("?"));
        assert!(is_unrestricted("*/1"));
        assert!(!is_unrestricted("1-5"));
    }

    #[test]
    fn interval_beyond_time_range_is_rejected() {
        let err = CronSchedule::parse("@every 9999999999h").unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEDULE");
        assert!(CronSchedule::parse("@every 99999999999999999999h").is_err());
    }

    #[test]
    fn deadline_beyond_time_range_clamps_nothing() {
        let sched = CronSchedule::parse("* * * * *").unwrap();
        let now = t0() + Duration::seconds(125);
        for deadline in [
            Duration::max_value(),
            Duration::try_seconds(10_000_000_000_000).unwrap(),
        ] {
            let times = next_schedule(&sched, t0(), Some(deadline), now).unwrap();
            assert_eq!(times.last_missed, Some(t0() + Duration::seconds(120)));
            assert_eq!(times.next, t0() + Duration::seconds(180));
        }
    }
}
