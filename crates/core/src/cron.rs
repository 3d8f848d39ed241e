//! Five-field cron validation and next-run planning.
//!
//! Grammar per field: `*`, `n`, `a-b`, `*/s`, `a-b/s`, `n/s`, and comma
//! separated lists of any of these. Fields are minute (0-59), hour (0-23),
//! day-of-month (1-31), month (1-12) and day-of-week (0-7, both 0 and 7 are
//! Sunday). All times are interpreted in UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};

use crate::error::{DomainError, DomainResult};

/// How far ahead [`CronPattern::next_after`] searches before giving up.
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7 };

/// Set of allowed values for one field, as a bitmask over 0..=63.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ValueSet(u64);

impl ValueSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1u64 << value) != 0
    }

    fn insert(&mut self, value: u32) {
        self.0 |= 1u64 << value;
    }
}

/// A parsed, validated five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronPattern {
    source: String,
    minutes: ValueSet,
    hours: ValueSet,
    days_of_month: ValueSet,
    months: ValueSet,
    days_of_week: ValueSet,
    // A field written starting with `*` does not restrict the day on its own.
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronPattern {
    /// Parse and validate a cron expression.
    pub fn parse(pattern: &str) -> DomainResult<Self> {
        let fields: Vec<&str> = pattern.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(DomainError::invalid_pattern(format!(
                "expected 5 fields, got {}",
                fields.len()
            )));
        }

        let mut days_of_week = parse_field(fields[4], DAY_OF_WEEK)?;
        if days_of_week.contains(7) {
            days_of_week.insert(0);
        }

        Ok(Self {
            source: fields.join(" "),
            minutes: parse_field(fields[0], MINUTE)?,
            hours: parse_field(fields[1], HOUR)?,
            days_of_month: parse_field(fields[2], DAY_OF_MONTH)?,
            months: parse_field(fields[3], MONTH)?,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    /// Normalised source text (single spaces between fields).
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First matching minute strictly after `now` (truncated to the minute).
    ///
    /// Returns `None` when nothing matches within five years, which only
    /// happens for impossible dates such as `0 0 30 2 *`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = truncate_to_minute(now.naive_utc()) + Duration::minutes(1);
        let horizon = start + Duration::days(SEARCH_HORIZON_DAYS);
        let mut t = start;

        while t <= horizon {
            if !self.months.contains(t.month()) {
                t = first_of_next_month(t.date())?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = truncate_to_hour(t) + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t.and_utc());
        }

        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self.days_of_week.contains(date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl core::fmt::Display for CronPattern {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.source)
    }
}

impl core::str::FromStr for CronPattern {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Whether `pattern` is a valid five-field cron expression. Never panics.
pub fn is_valid_pattern(pattern: &str) -> bool {
    CronPattern::parse(pattern).is_ok()
}

/// Next run time for `pattern` strictly after `now`; `None` for invalid or
/// unsatisfiable patterns.
pub fn compute_next_run(pattern: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    CronPattern::parse(pattern).ok()?.next_after(now)
}

fn parse_field(text: &str, spec: FieldSpec) -> DomainResult<ValueSet> {
    let mut set = ValueSet(0);
    for item in text.split(',') {
        parse_item(item, spec, &mut set)?;
    }
    Ok(set)
}

fn parse_item(item: &str, spec: FieldSpec, set: &mut ValueSet) -> DomainResult<()> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => {
            let step = parse_number(step, spec)?;
            if step == 0 {
                return Err(DomainError::invalid_pattern(format!(
                    "{}: step must be positive",
                    spec.name
                )));
            }
            (range, Some(step))
        }
        None => (item, None),
    };

    let (start, end) = if range == "*" {
        (spec.min, spec.max)
    } else if let Some((a, b)) = range.split_once('-') {
        let (a, b) = (parse_value(a, spec)?, parse_value(b, spec)?);
        if a > b {
            return Err(DomainError::invalid_pattern(format!(
                "{}: range {a}-{b} is reversed",
                spec.name
            )));
        }
        (a, b)
    } else {
        let value = parse_value(range, spec)?;
        // `n/s` means "from n to the end of the field, every s".
        match step {
            Some(_) => (value, spec.max),
            None => (value, value),
        }
    };

    let step = step.unwrap_or(1);
    let mut value = start;
    while value <= end {
        set.insert(value);
        match value.checked_add(step) {
            Some(next) => value = next,
            None => break,
        }
    }
    Ok(())
}

fn parse_value(text: &str, spec: FieldSpec) -> DomainResult<u32> {
    let value = parse_number(text, spec)?;
    if value < spec.min || value > spec.max {
        return Err(DomainError::invalid_pattern(format!(
            "{}: {value} is outside {}-{}",
            spec.name, spec.min, spec.max
        )));
    }
    Ok(value)
}

fn parse_number(text: &str, spec: FieldSpec) -> DomainResult<u32> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DomainError::invalid_pattern(format!(
            "{}: '{text}' is not a number",
            spec.name
        )));
    }
    text.parse::<u32>()
        .map_err(|e| DomainError::invalid_pattern(format!("{}: {e}", spec.name)))
}

fn truncate_to_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

fn truncate_to_hour(t: NaiveDateTime) -> NaiveDateTime {
    truncate_to_minute(t).with_minute(0).unwrap_or(t)
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn accepts_documented_patterns() {
        assert!(is_valid_pattern("* * * * *"));
        assert!(is_valid_pattern("*/15 9-17 * * 1-5"));
        assert!(is_valid_pattern("0 0 1,15 * 0,7"));
        assert!(is_valid_pattern("5-50/5 */2 1-31/10 1,6-12/2 *"));
    }

    #[test]
    fn rejects_out_of_range_and_wrong_arity() {
        assert!(!is_valid_pattern("60 * * * *"));
        assert!(!is_valid_pattern("* * * *"));
        assert!(!is_valid_pattern("* * * * * *"));
        assert!(!is_valid_pattern("* 24 * * *"));
        assert!(!is_valid_pattern("* * 0 * *"));
        assert!(!is_valid_pattern("* * * 13 *"));
        assert!(!is_valid_pattern("* * * * 8"));
    }

    #[test]
    fn rejects_malformed_items() {
        assert!(!is_valid_pattern("*/0 * * * *"));
        assert!(!is_valid_pattern("5-1 * * * *"));
        assert!(!is_valid_pattern("a * * * *"));
        assert!(!is_valid_pattern("1,,2 * * * *"));
        assert!(!is_valid_pattern("-1 * * * *"));
        assert!(!is_valid_pattern(""));
    }

    #[test]
    fn oversized_step_keeps_only_the_start() {
        assert!(is_valid_pattern("59/4294967295 * * * *"));
        assert!(is_valid_pattern("*/4294967295 * * * *"));
        let now = at(2024, 3, 10, 12, 30, 45);
        assert_eq!(compute_next_run("59/4294967295 * * * *", now), Some(at(2024, 3, 10, 12, 59, 0)));
        assert!(!is_valid_pattern("*/4294967296 * * * *"));
    }

    #[test]
    fn every_minute_is_the_next_minute() {
        let now = at(2024, 3, 10, 12, 30, 45);
        assert_eq!(compute_next_run("* * * * *", now), Some(at(2024, 3, 10, 12, 31, 0)));
    }

    #[test]
    fn next_run_is_strictly_after_an_exact_match() {
        let now = at(2024, 3, 10, 12, 30, 0);
        assert_eq!(compute_next_run("30 12 * * *", now), Some(at(2024, 3, 11, 12, 30, 0)));
    }

    #[test]
    fn business_hours_pattern_skips_weekend() {
        // 2024-03-09 is a Saturday.
        let now = at(2024, 3, 9, 10, 0, 0);
        assert_eq!(
            compute_next_run("*/15 9-17 * * 1-5", now),
            Some(at(2024, 3, 11, 9, 0, 0))
        );
    }

    #[test]
    fn sunday_can_be_written_as_seven() {
        let now = at(2024, 3, 11, 0, 0, 0);
        assert_eq!(compute_next_run("0 3 * * 7", now), compute_next_run("0 3 * * 0", now));
        assert_eq!(compute_next_run("0 3 * * 7", now), Some(at(2024, 3, 17, 3, 0, 0)));
    }

    #[test]
    fn restricted_day_fields_match_either() {
        // 1st of the month OR a Monday; 2024-04-01 is a Monday, so start just after it.
        let now = at(2024, 4, 1, 1, 0, 0);
        assert_eq!(compute_next_run("0 0 1 * 1", now), Some(at(2024, 4, 8, 0, 0, 0)));
    }

    #[test]
    fn rolls_over_year_end() {
        let now = at(2024, 12, 31, 23, 59, 30);
        assert_eq!(compute_next_run("0 0 1 1 *", now), Some(at(2025, 1, 1, 0, 0, 0)));
    }

    #[test]
    fn leap_day_is_found() {
        let now = at(2024, 3, 1, 0, 0, 0);
        assert_eq!(compute_next_run("0 12 29 2 *", now), Some(at(2028, 2, 29, 12, 0, 0)));
    }

    #[test]
    fn impossible_date_yields_none() {
        assert_eq!(compute_next_run("0 0 30 2 *", at(2024, 1, 1, 0, 0, 0)), None);
        assert_eq!(compute_next_run("bogus", at(2024, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn source_is_normalised() {
        let pattern = CronPattern::parse("  */5   *  * * *").unwrap();
        assert_eq!(pattern.as_str(), "*/5 * * * *");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: any in-range single-value pattern is valid and its next run lands on those values.
        #[test]
        fn single_values_plan_onto_themselves(
            minute in 0u32..60,
            hour in 0u32..24,
            offset_minutes in 0i64..600_000,
        ) {
            let pattern = format!("{minute} {hour} * * *");
            prop_assert!(is_valid_pattern(&pattern));

            let now = at(2024, 1, 1, 0, 0, 0) + Duration::minutes(offset_minutes);
            let next = compute_next_run(&pattern, now).unwrap();
            prop_assert!(next > now);
            prop_assert_eq!(next.minute(), minute);
            prop_assert_eq!(next.hour(), hour);
            prop_assert!(next - now <= Duration::days(1));
        }

        /// Property: validation never panics on arbitrary input.
        #[test]
        fn validation_is_total(input in "[0-9*/,\\- ]{0,30}") {
            let _ = is_valid_pattern(&input);
        }
    }
}
