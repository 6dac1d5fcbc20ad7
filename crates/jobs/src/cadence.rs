//! Recurrence expressions for recurring schedules.
//!
//! Accepted forms:
//!
//! - `@every <duration>` and bare durations: `90s`, `15m`, `1h30m`, `2d`
//! - shortcuts: `@minutely`, `@hourly`, `@daily` (`@midnight`), `@weekly`, `@monthly`
//! - five-field cron, `minute hour day-of-month month day-of-week`, with `*`,
//!   numbers, ranges (`1-5`), lists (`1,15`) and steps (`*/10`, `0-30/5`).
//!   Day-of-week is `0-6` with Sunday as `0` (or `7`). When both day fields are
//!   restricted a day matches if either does; a field starting with `*` (such
//!   as `*/2`) is unrestricted and narrows the other day field instead.
//!
//! All evaluation happens in UTC.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cron searches give up after this many years without a match (e.g. `0 0 31 2 *`).
const MAX_SEARCH_YEARS: i32 = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CadenceError {
    #[error("empty cadence expression")]
    Empty,
    #[error("invalid duration `{0}`")]
    InvalidDuration(String),
    #[error("cron expression must have 5 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid {field} field `{value}`")]
    InvalidField { field: &'static str, value: String },
    #[error("unknown shortcut `{0}`")]
    UnknownShortcut(String),
    #[error("expression `{0}` never fires")]
    NeverFires(String),
}

/// A parsed recurrence expression.
///
/// Serializes as its source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cadence {
    expression: String,
    kind: CadenceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CadenceKind {
    Interval(Duration),
    Cron(CronSchedule),
}

impl Cadence {
    pub fn parse(expression: &str) -> Result<Self, CadenceError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(CadenceError::Empty);
        }

        let kind = if let Some(rest) = trimmed.strip_prefix("@every") {
            CadenceKind::Interval(parse_duration(rest.trim())?)
        } else if trimmed.starts_with('@') {
            let cron = match trimmed {
                "@minutely" => "* * * * *",
                "@hourly" => "0 * * * *",
                "@daily" | "@midnight" => "0 0 * * *",
                "@weekly" => "0 0 * * 0",
                "@monthly" => "0 0 1 * *",
                other => return Err(CadenceError::UnknownShortcut(other.to_string())),
            };
            CadenceKind::Cron(CronSchedule::parse(cron)?)
        } else if trimmed.split_whitespace().count() == 1 {
            CadenceKind::Interval(parse_duration(trimmed)?)
        } else {
            CadenceKind::Cron(CronSchedule::parse(trimmed)?)
        };

        Ok(Self {
            expression: trimmed.to_string(),
            kind,
        })
    }

    /// Fixed-interval cadence.
    pub fn every(interval: Duration) -> Result<Self, CadenceError> {
        if interval.is_zero() {
            return Err(CadenceError::InvalidDuration("0s".to_string()));
        }
        Ok(Self {
            expression: format!("@every {}s", interval.as_secs().max(1)),
            kind: CadenceKind::Interval(interval),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The fixed interval, for interval cadences.
    pub fn interval(&self) -> Option<Duration> {
        match &self.kind {
            CadenceKind::Interval(d) => Some(*d),
            CadenceKind::Cron(_) => None,
        }
    }

    /// First occurrence strictly after `after`.
    ///
    /// `None` only for cron expressions that never match (e.g. February 30th).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            CadenceKind::Interval(interval) => {
                let delta = TimeDelta::from_std(*interval).ok()?;
                after.checked_add_signed(delta)
            }
            CadenceKind::Cron(cron) => cron.next_after(after),
        }
    }
}

impl FromStr for Cadence {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Cadence {
    type Error = CadenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Cadence> for String {
    fn from(value: Cadence) -> Self {
        value.expression
    }
}

impl core::fmt::Display for Cadence {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Parse `1h30m`-style durations (units: `s`, `m`, `h`, `d`).
fn parse_duration(input: &str) -> Result<Duration, CadenceError> {
    let invalid = || CadenceError::InvalidDuration(input.to_string());

    if input.is_empty() {
        return Err(invalid());
    }

    let mut total: u64 = 0;
    let mut digits = String::new();

    for ch in input.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }

        let unit_secs = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            _ => return Err(invalid()),
        };
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();

        total = value
            .checked_mul(unit_secs)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
    }

    // trailing digits without a unit
    if !digits.is_empty() || total == 0 {
        return Err(invalid());
    }

    Ok(Duration::from_secs(total))
}

/// Bit set over the allowed values of one cron field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    restricted: bool,
}

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.bits & (1 << value) != 0
    }

    fn parse(field: &'static str, raw: &str, min: u32, max: u32) -> Result<Self, CadenceError> {
        let invalid = || CadenceError::InvalidField {
            field,
            value: raw.to_string(),
        };

        let mut bits = 0u64;
        for part in raw.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| invalid())?;
                    if step == 0 {
                        return Err(invalid());
                    }
                    (range, step)
                }
                None => (part, 1),
            };

            let (start, end) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                let a: u32 = a.parse().map_err(|_| invalid())?;
                let b: u32 = b.parse().map_err(|_| invalid())?;
                (a, b)
            } else {
                let a: u32 = range.parse().map_err(|_| invalid())?;
                // `5/15` means "from 5 to the end, every 15"
                if part.contains('/') { (a, max) } else { (a, a) }
            };

            if start < min || end > max || start > end {
                return Err(invalid());
            }

            let mut value = Some(start);
            while let Some(current) = value.filter(|v| *v <= end) {
                bits |= 1 << current;
                value = current.checked_add(step);
            }
        }

        Ok(Self {
            bits,
            restricted: !raw.starts_with('*'),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CronSchedule {
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    day_of_week: FieldSet,
}

impl CronSchedule {
    fn parse(expression: &str) -> Result<Self, CadenceError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CadenceError::FieldCount(fields.len()));
        }

        let mut day_of_week = FieldSet::parse("day-of-week", fields[4], 0, 7)?;
        // 7 is an alias for Sunday
        if day_of_week.contains(7) {
            day_of_week.bits = (day_of_week.bits & !(1 << 7)) | 1;
        }

        Ok(Self {
            minute: FieldSet::parse("minute", fields[0], 0, 59)?,
            hour: FieldSet::parse("hour", fields[1], 0, 23)?,
            day_of_month: FieldSet::parse("day-of-month", fields[2], 1, 31)?,
            month: FieldSet::parse("month", fields[3], 1, 12)?,
            day_of_week,
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.contains(date.day());
        let dow = self
            .day_of_week
            .contains(date.weekday().num_days_from_sunday());

        match (self.day_of_month.restricted, self.day_of_week.restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let floor = after.timestamp().div_euclid(60) * 60;
        let mut candidate = DateTime::<Utc>::from_timestamp(floor, 0)? + TimeDelta::minutes(1);
        let limit_year = candidate.year() + MAX_SEARCH_YEARS;

        while candidate.year() <= limit_year {
            if !self.month.contains(candidate.month()) {
                let (year, month) = if candidate.month() == 12 {
                    (candidate.year() + 1, 1)
                } else {
                    (candidate.year(), candidate.month() + 1)
                };
                candidate = NaiveDate::from_ymd_opt(year, month, 1)?
                    .and_hms_opt(0, 0, 0)?
                    .and_utc();
                continue;
            }

            if !self.day_matches(candidate.date_naive()) {
                candidate = candidate.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc();
                continue;
            }

            if !self.hour.contains(candidate.hour()) {
                candidate = candidate.with_minute(0)? + TimeDelta::hours(1);
                continue;
            }

            if !self.minute.contains(candidate.minute()) {
                candidate += TimeDelta::minutes(1);
                continue;
            }

            return Some(candidate);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn parses_every_and_bare_durations() {
        let every = Cadence::parse("@every 1h30m").unwrap();
        assert_eq!(every.interval(), Some(Duration::from_secs(5_400)));

        let bare = Cadence::parse("15m").unwrap();
        assert_eq!(bare.interval(), Some(Duration::from_secs(900)));

        let start = at(2026, 1, 1, 10, 0);
        assert_eq!(bare.next_after(start), Some(at(2026, 1, 1, 10, 15)));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(matches!(
            Cadence::parse("@every 10"),
            Err(CadenceError::InvalidDuration(_))
        ));
        assert!(matches!(
            Cadence::parse("@every 0s"),
            Err(CadenceError::InvalidDuration(_))
        ));
        assert!(matches!(
            Cadence::parse("5x"),
            Err(CadenceError::InvalidDuration(_))
        ));
        assert_eq!(Cadence::parse("   "), Err(CadenceError::Empty));
    }

    #[test]
    fn hourly_shortcut_fires_at_top_of_hour() {
        let cadence = Cadence::parse("@hourly").unwrap();
        assert_eq!(
            cadence.next_after(at(2026, 3, 4, 10, 0)),
            Some(at(2026, 3, 4, 11, 0))
        );
        assert_eq!(
            cadence.next_after(at(2026, 3, 4, 10, 59)),
            Some(at(2026, 3, 4, 11, 0))
        );
    }

    #[test]
    fn step_and_range_fields() {
        let cadence = Cadence::parse("*/15 9-17 * * 1-5").unwrap();
        // Friday 17:50 -> next is Monday 09:00
        let friday = at(2026, 10, 16, 17, 50);
        assert_eq!(friday.weekday(), chrono::Weekday::Fri);
        assert_eq!(cadence.next_after(friday), Some(at(2026, 10, 19, 9, 0)));

        assert_eq!(
            cadence.next_after(at(2026, 10, 19, 9, 0)),
            Some(at(2026, 10, 19, 9, 15))
        );
    }

    #[test]
    fn month_rollover_crosses_year_boundary() {
        let cadence = Cadence::parse("@monthly").unwrap();
        assert_eq!(
            cadence.next_after(at(2026, 12, 15, 0, 0)),
            Some(at(2027, 1, 1, 0, 0))
        );
    }

    #[test]
    fn restricted_day_fields_match_either() {
        // 13th of the month or any Friday
        let cadence = Cadence::parse("0 0 13 * 5").unwrap();
        // 2026-10-16 is a Friday; starting on the 14th, Friday 16th comes first.
        assert_eq!(
            cadence.next_after(at(2026, 10, 14, 0, 0)),
            Some(at(2026, 10, 16, 0, 0))
        );
    }

    #[test]
    fn star_step_day_field_narrows_the_other() {
        // odd days that are also Mondays
        let cadence = Cadence::parse("0 0 */2 * 1").unwrap();
        let wednesday = at(2026, 10, 14, 0, 0);
        assert_eq!(wednesday.weekday(), chrono::Weekday::Wed);
        assert_eq!(cadence.next_after(wednesday), Some(at(2026, 10, 19, 0, 0)));

        let weekday_step = Cadence::parse("0 0 13 * */2").unwrap();
        // 13th of the month on Sun/Tue/Thu/Sat; 2026-10-13 is a Tuesday
        assert_eq!(
            weekday_step.next_after(at(2026, 10, 1, 0, 0)),
            Some(at(2026, 10, 13, 0, 0))
        );
    }

    #[test]
    fn oversized_step_selects_only_the_start() {
        let cadence = Cadence::parse("1/4294967295 * * * *").unwrap();
        assert_eq!(
            cadence.next_after(at(2026, 5, 5, 5, 5)),
            Some(at(2026, 5, 5, 6, 1))
        );

        let hourly = Cadence::parse("0 5/4294967295 * * *").unwrap();
        assert_eq!(
            hourly.next_after(at(2026, 5, 5, 5, 0)),
            Some(at(2026, 5, 6, 5, 0))
        );
    }

    #[test]
    fn sunday_alias_seven() {
        let seven = Cadence::parse("0 0 * * 7").unwrap();
        let zero = Cadence::parse("0 0 * * 0").unwrap();
        let start = at(2026, 10, 14, 12, 0);
        assert_eq!(seven.next_after(start), zero.next_after(start));
    }

    #[test]
    fn impossible_dates_yield_none() {
        let cadence = Cadence::parse("0 0 30 2 *").unwrap();
        assert_eq!(cadence.next_after(at(2026, 1, 1, 0, 0)), None);
    }

    #[test]
    fn invalid_cron_fields_are_reported() {
        assert!(matches!(
            Cadence::parse("61 * * * *"),
            Err(CadenceError::InvalidField { field: "minute", .. })
        ));
        assert!(matches!(
            Cadence::parse("* * * *"),
            Err(CadenceError::FieldCount(4))
        ));
        assert!(matches!(
            Cadence::parse("@yearly"),
            Err(CadenceError::UnknownShortcut(_))
        ));
    }

    #[test]
    fn serializes_as_expression_text() {
        let cadence = Cadence::parse("@every 5m").unwrap();
        let json = serde_json::to_string(&cadence).unwrap();
        assert_eq!(json, "\"@every 5m\"");

        let back: Cadence = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cadence);
    }

    #[test]
    fn next_occurrence_is_strictly_later() {
        let cadence = Cadence::parse("* * * * *").unwrap();
        let now = at(2026, 5, 5, 5, 5);
        assert_eq!(cadence.next_after(now), Some(at(2026, 5, 5, 5, 6)));
    }
}
