//! Cron recurrence
//!
//! Five-field cron expressions (`minute hour day-of-month month day-of-week`)
//! plus the usual `@monthly`-style presets. Expressions are evaluated in a
//! fixed UTC offset chosen by the scheduler; returned instants are UTC.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ScheduleError;

/// Upper bound on the search for the next match
const MAX_SEARCH_YEARS: i32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    /// Bit `n` set when value `n` matches
    bits: u64,
    /// Whether the field was written as `*` (matters for day-of-month/day-of-week)
    wildcard: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }
}

/// Parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronSchedule {
    source: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let source = expr.trim().to_string();
        let expanded = match source.as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other if other.starts_with('@') => {
                return Err(ScheduleError::UnknownPreset(other.to_string()));
            }
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount(fields.len()));
        }

        let mut days_of_week = parse_field(fields[4], "day-of-week", 0, 7)?;
        // 7 is an alias for Sunday
        if days_of_week.contains(7) {
            days_of_week.bits |= 1;
            days_of_week.bits &= !(1u64 << 7);
        }

        let schedule = Self {
            minutes: parse_field(fields[0], "minute", 0, 59)?,
            hours: parse_field(fields[1], "hour", 0, 23)?,
            days_of_month: parse_field(fields[2], "day-of-month", 1, 31)?,
            months: parse_field(fields[3], "month", 1, 12)?,
            days_of_week,
            source,
        };

        if !schedule.any_day_possible() {
            return Err(ScheduleError::NeverFires);
        }

        Ok(schedule)
    }

    /// The expression as written
    pub fn expression(&self) -> &str {
        &self.source
    }

    /// First tick strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>, offset: FixedOffset) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&offset).naive_local();
        let start = truncate_to_minute(local) + Duration::minutes(1);
        let limit = start + Duration::days(366 * MAX_SEARCH_YEARS as i64);

        let mut date = start.date();
        let mut first_day = true;
        while date.and_time(chrono::NaiveTime::MIN) <= limit {
            if !self.months.contains(date.month()) {
                date = first_of_next_month(date)?;
                first_day = false;
                continue;
            }
            if self.day_matches(date) {
                let (from_hour, from_minute) = if first_day {
                    (start.hour(), start.minute())
                } else {
                    (0, 0)
                };
                if let Some(time) = self.first_time_on_day(from_hour, from_minute) {
                    let naive = date.and_time(time);
                    return to_utc(naive, offset);
                }
            }
            date = date.succ_opt()?;
            first_day = false;
        }
        None
    }

    /// Latest tick at or before `at`
    pub fn latest_at_or_before(
        &self,
        at: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Option<DateTime<Utc>> {
        let local = at.with_timezone(&offset).naive_local();
        let end = truncate_to_minute(local);
        let limit = end - Duration::days(366 * MAX_SEARCH_YEARS as i64);

        let mut date = end.date();
        let mut first_day = true;
        while date.and_time(chrono::NaiveTime::MIN) >= limit {
            if self.months.contains(date.month()) && self.day_matches(date) {
                let (to_hour, to_minute) = if first_day {
                    (end.hour(), end.minute())
                } else {
                    (23, 59)
                };
                if let Some(time) = self.last_time_on_day(to_hour, to_minute) {
                    return to_utc(date.and_time(time), offset);
                }
            }
            date = date.pred_opt()?;
            first_day = false;
        }
        None
    }

    /// Ticks that should fire now
    ///
    /// `last_fired` is the most recent tick already run (if any). Ticks before
    /// `start_date` or after `now` never fire. Without catch-up only the most
    /// recent due tick is returned; with catch-up every missed tick is
    /// returned in chronological order.
    pub fn due_ticks(
        &self,
        last_fired: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        start_date: DateTime<Utc>,
        catchup: bool,
        offset: FixedOffset,
    ) -> Vec<DateTime<Utc>> {
        let Some(latest) = self.latest_at_or_before(now, offset) else {
            return Vec::new();
        };
        if latest < start_date || last_fired.is_some_and(|last| latest <= last) {
            return Vec::new();
        }
        if !catchup {
            return vec![latest];
        }

        let floor = match last_fired {
            Some(last) if last >= start_date => last,
            _ => start_date - Duration::minutes(1),
        };
        let mut ticks = Vec::new();
        let mut cursor = floor;
        while let Some(tick) = self.next_after(cursor, offset) {
            if tick > latest {
                break;
            }
            if tick >= start_date {
                ticks.push(tick);
            }
            cursor = tick;
        }
        ticks
    }

    /// Upcoming ticks after `after`, at most `count` of them
    pub fn upcoming(
        &self,
        after: DateTime<Utc>,
        count: usize,
        offset: FixedOffset,
    ) -> Vec<DateTime<Utc>> {
        let mut ticks = Vec::with_capacity(count);
        let mut cursor = after;
        while ticks.len() < count {
            match self.next_after(cursor, offset) {
                Some(tick) => {
                    ticks.push(tick);
                    cursor = tick;
                }
                None => break,
            }
        }
        ticks
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (self.days_of_month.wildcard, self.days_of_week.wildcard) {
            (true, true) => true,
            (false, true) => dom,
            (true, false) => dow,
            // Both restricted: classic cron matches either
            (false, false) => dom || dow,
        }
    }

    fn first_time_on_day(&self, from_hour: u32, from_minute: u32) -> Option<chrono::NaiveTime> {
        for hour in from_hour..24 {
            if !self.hours.contains(hour) {
                continue;
            }
            let start_minute = if hour == from_hour { from_minute } else { 0 };
            for minute in start_minute..60 {
                if self.minutes.contains(minute) {
                    return chrono::NaiveTime::from_hms_opt(hour, minute, 0);
                }
            }
        }
        None
    }

    fn last_time_on_day(&self, to_hour: u32, to_minute: u32) -> Option<chrono::NaiveTime> {
        for hour in (0..=to_hour).rev() {
            if !self.hours.contains(hour) {
                continue;
            }
            let end_minute = if hour == to_hour { to_minute } else { 59 };
            for minute in (0..=end_minute).rev() {
                if self.minutes.contains(minute) {
                    return chrono::NaiveTime::from_hms_opt(hour, minute, 0);
                }
            }
        }
        None
    }

    /// Rejects expressions like `0 0 31 2 *` that name no real date
    fn any_day_possible(&self) -> bool {
        if !self.days_of_week.wildcard {
            return true;
        }
        const MAX_DAYS: [u32; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
        (1..=12u32)
            .filter(|&m| self.months.contains(m))
            .any(|m| (1..=MAX_DAYS[(m - 1) as usize]).any(|d| self.days_of_month.contains(d)))
    }
}

impl FromStr for CronSchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CronSchedule {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CronSchedule> for String {
    fn from(schedule: CronSchedule) -> Self {
        schedule.source
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parses a fixed offset such as `+00:00`, `-05:00` or `Z`
pub fn parse_offset(value: &str) -> Option<FixedOffset> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("z") || value.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match value.as_bytes().first()? {
        b'+' => (1, &value[1..]),
        b'-' => (-1, &value[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn parse_field(token: &str, field: &'static str, min: u32, max: u32) -> Result<Field, ScheduleError> {
    let malformed = || ScheduleError::Malformed {
        field,
        token: token.to_string(),
    };
    let number = |s: &str| -> Result<u32, ScheduleError> {
        let value: u32 = s.parse().map_err(|_| malformed())?;
        if value < min || value > max {
            return Err(ScheduleError::OutOfRange {
                field,
                value,
                min,
                max,
            });
        }
        Ok(value)
    };

    let mut bits = 0u64;
    for part in token.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| malformed())?;
                if step == 0 {
                    return Err(ScheduleError::ZeroStep { field });
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (number(a)?, number(b)?);
            if a > b {
                return Err(malformed());
            }
            (a, b)
        } else {
            let value = number(range)?;
            // `5/15` means "from 5 to the end, every 15"
            if step.is_some() { (value, max) } else { (value, value) }
        };

        let step = step.unwrap_or(1);
        let mut v = lo;
        while v <= hi {
            bits |= 1u64 << v;
            v += step;
        }
    }

    Ok(Field {
        bits,
        wildcard: token == "*",
    })
}

fn truncate_to_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

fn to_utc(naive: NaiveDateTime, offset: FixedOffset) -> Option<DateTime<Utc>> {
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_monthly_next_after() {
        let cron = CronSchedule::parse("0 6 1 * *").unwrap();
        assert_eq!(
            cron.next_after(at(2025, 1, 15, 0, 0), utc()),
            Some(at(2025, 2, 1, 6, 0))
        );
        // Exactly on a tick moves to the next one
        assert_eq!(
            cron.next_after(at(2025, 2, 1, 6, 0), utc()),
            Some(at(2025, 3, 1, 6, 0))
        );
        assert_eq!(
            cron.next_after(at(2025, 12, 31, 23, 59), utc()),
            Some(at(2026, 1, 1, 6, 0))
        );
    }

    #[test]
    fn test_monthly_respects_offset() {
        let cron = CronSchedule::parse("0 6 1 * *").unwrap();
        let cet = parse_offset("+01:00").unwrap();
        assert_eq!(
            cron.next_after(at(2025, 1, 15, 0, 0), cet),
            Some(at(2025, 2, 1, 5, 0))
        );
    }

    #[test]
    fn test_latest_at_or_before() {
        let cron = CronSchedule::parse("0 6 1 * *").unwrap();
        assert_eq!(
            cron.latest_at_or_before(at(2025, 3, 5, 12, 0), utc()),
            Some(at(2025, 3, 1, 6, 0))
        );
        assert_eq!(
            cron.latest_at_or_before(at(2025, 3, 1, 6, 0), utc()),
            Some(at(2025, 3, 1, 6, 0))
        );
        assert_eq!(
            cron.latest_at_or_before(at(2025, 3, 1, 5, 59), utc()),
            Some(at(2025, 2, 1, 6, 0))
        );
    }

    #[test]
    fn test_due_ticks_without_catchup_returns_latest_only() {
        let cron = CronSchedule::parse("0 6 1 * *").unwrap();
        let start = at(2025, 1, 1, 0, 0);
        let ticks = cron.due_ticks(None, at(2025, 4, 10, 0, 0), start, false, utc());
        assert_eq!(ticks, vec![at(2025, 4, 1, 6, 0)]);

        // Already fired
        let ticks = cron.due_ticks(
            Some(at(2025, 4, 1, 6, 0)),
            at(2025, 4, 10, 0, 0),
            start,
            false,
            utc(),
        );
        assert!(ticks.is_empty());
    }

    #[test]
    fn test_due_ticks_with_catchup_returns_every_missed_tick() {
        let cron = CronSchedule::parse("0 6 1 * *").unwrap();
        let start = at(2025, 1, 1, 0, 0);
        let ticks = cron.due_ticks(None, at(2025, 3, 2, 0, 0), start, true, utc());
        assert_eq!(
            ticks,
            vec![at(2025, 1, 1, 6, 0), at(2025, 2, 1, 6, 0), at(2025, 3, 1, 6, 0)]
        );

        let ticks = cron.due_ticks(
            Some(at(2025, 2, 1, 6, 0)),
            at(2025, 4, 2, 0, 0),
            start,
            true,
            utc(),
        );
        assert_eq!(ticks, vec![at(2025, 3, 1, 6, 0), at(2025, 4, 1, 6, 0)]);
    }

    #[test]
    fn test_due_ticks_before_start_date() {
        let cron = CronSchedule::parse("0 6 1 * *").unwrap();
        let start = at(2025, 6, 1, 0, 0);
        assert!(cron
            .due_ticks(None, at(2025, 5, 20, 0, 0), start, false, utc())
            .is_empty());
    }

    #[test]
    fn test_steps_lists_and_ranges() {
        let cron = CronSchedule::parse("*/15 9-17 * * 1-5").unwrap();
        // Saturday 2025-03-01 -> Monday 2025-03-03 09:00
        assert_eq!(
            cron.next_after(at(2025, 3, 1, 10, 0), utc()),
            Some(at(2025, 3, 3, 9, 0))
        );
        assert_eq!(
            cron.next_after(at(2025, 3, 3, 9, 0), utc()),
            Some(at(2025, 3, 3, 9, 15))
        );

        let cron = CronSchedule::parse("5,35 0 * * *").unwrap();
        assert_eq!(
            cron.upcoming(at(2025, 1, 1, 0, 0), 3, utc()),
            vec![at(2025, 1, 1, 0, 5), at(2025, 1, 1, 0, 35), at(2025, 1, 2, 0, 5)]
        );
    }

    #[test]
    fn test_day_of_month_or_day_of_week() {
        // 13th of the month or any Friday
        let cron = CronSchedule::parse("0 0 13 * 5").unwrap();
        // 2025-06-01 is a Sunday; first Friday is 2025-06-06
        assert_eq!(
            cron.next_after(at(2025, 6, 1, 0, 0), utc()),
            Some(at(2025, 6, 6, 0, 0))
        );
    }

    #[test]
    fn test_sunday_alias() {
        let a = CronSchedule::parse("0 0 * * 7").unwrap();
        let b = CronSchedule::parse("0 0 * * 0").unwrap();
        let from = at(2025, 6, 2, 0, 0);
        assert_eq!(a.next_after(from, utc()), b.next_after(from, utc()));
    }

    #[test]
    fn test_presets() {
        let monthly = CronSchedule::parse("@monthly").unwrap();
        assert_eq!(
            monthly.next_after(at(2025, 1, 15, 0, 0), utc()),
            Some(at(2025, 2, 1, 0, 0))
        );
        assert_eq!(monthly.expression(), "@monthly");
        assert!(matches!(
            CronSchedule::parse("@fortnightly"),
            Err(ScheduleError::UnknownPreset(_))
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            CronSchedule::parse("0 6 1 *"),
            Err(ScheduleError::FieldCount(4))
        );
        assert!(matches!(
            CronSchedule::parse("60 6 1 * *"),
            Err(ScheduleError::OutOfRange { field: "minute", .. })
        ));
        assert!(matches!(
            CronSchedule::parse("*/0 6 1 * *"),
            Err(ScheduleError::ZeroStep { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("a 6 1 * *"),
            Err(ScheduleError::Malformed { .. })
        ));
        assert_eq!(
            CronSchedule::parse("0 0 31 2 *"),
            Err(ScheduleError::NeverFires)
        );
    }

    #[test]
    fn test_serde_as_string() {
        let cron = CronSchedule::parse("0 6 1 * *").unwrap();
        let json = serde_json::to_string(&cron).unwrap();
        assert_eq!(json, "\"0 6 1 * *\"");
        let back: CronSchedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cron);
    }

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("+00:00"), FixedOffset::east_opt(0));
        assert_eq!(parse_offset("-05:30"), FixedOffset::west_opt(5 * 3600 + 30 * 60));
        assert_eq!(parse_offset("Z"), FixedOffset::east_opt(0));
        assert_eq!(parse_offset("+2"), FixedOffset::east_opt(7200));
        assert_eq!(parse_offset("0100"), None);
    }
}
