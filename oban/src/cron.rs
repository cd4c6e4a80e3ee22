//! Cron expression parsing and the periodic enqueue scheduler.
//!
//! Expressions use the standard five fields (minute, hour, day, month,
//! weekday) plus the common `@hourly`-style nicknames. Weekdays run 0–6 with
//! Sunday as 0; `JAN`–`DEC` and `SUN`–`SAT` aliases are accepted in upper
//! case only.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::job::NewJob;
use crate::leader::Leadership;
use crate::store::Store;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("incorrect number of fields: {0}")]
    FieldCount(String),
    #[error("unrecognized expression: {0}")]
    Unrecognized(String),
    #[error("field {field} is out of range: {input}")]
    OutOfRange { field: &'static str, input: String },
    #[error("min of range ({min}) must be less than or equal to max ({max})")]
    InvertedRange { min: u32, max: u32 },
}

const NICKNAMES: &[(&str, &str)] = &[
    ("@annually", "0 0 1 1 *"),
    ("@yearly", "0 0 1 1 *"),
    ("@monthly", "0 0 1 * *"),
    ("@weekly", "0 0 * * 0"),
    ("@midnight", "0 0 * * *"),
    ("@daily", "0 0 * * *"),
    ("@hourly", "0 * * * *"),
];

const MONTH_ALIASES: &[(&str, &str)] = &[
    ("JAN", "1"),
    ("FEB", "2"),
    ("MAR", "3"),
    ("APR", "4"),
    ("MAY", "5"),
    ("JUN", "6"),
    ("JUL", "7"),
    ("AUG", "8"),
    ("SEP", "9"),
    ("OCT", "10"),
    ("NOV", "11"),
    ("DEC", "12"),
];

const WEEKDAY_ALIASES: &[(&str, &str)] = &[
    ("SUN", "0"),
    ("MON", "1"),
    ("TUE", "2"),
    ("WED", "3"),
    ("THU", "4"),
    ("FRI", "5"),
    ("SAT", "6"),
];

static LITERAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").expect("valid regex"));
static STEP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\*/([1-9]\d?)$").expect("valid regex"));
static RANGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)-(\d+)$").expect("valid regex"));
static RANGE_STEP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+(?:-\d+)?)/([1-9]\d?)$").expect("valid regex"));

fn domain(min: u32, max: u32) -> BTreeSet<u32> {
    (min..=max).collect()
}

fn translate(field: &str, aliases: &[(&str, &str)]) -> String {
    let mut translated = field.to_owned();

    for (alias, value) in aliases {
        translated = translated.replace(alias, value);
    }

    translated
}

/// A parsed five-field cron expression, held as the concrete sets of matching
/// minutes, hours, days, months, and weekdays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    pub input: String,
    pub minutes: BTreeSet<u32>,
    pub hours: BTreeSet<u32>,
    pub days: BTreeSet<u32>,
    pub months: BTreeSet<u32>,
    pub weekdays: BTreeSet<u32>,
}

impl Expression {
    pub fn parse(input: &str) -> Result<Self, CronError> {
        let normalized = NICKNAMES
            .iter()
            .find(|(nickname, _)| *nickname == input)
            .map(|(_, expanded)| *expanded)
            .unwrap_or(input);

        let fields: Vec<&str> = normalized.split_whitespace().collect();

        let (minutes, hours, days, months, weekdays) = match fields.as_slice() {
            [minutes, hours, days, months, weekdays] => {
                (*minutes, *hours, *days, *months, *weekdays)
            }
            _ => return Err(CronError::FieldCount(normalized.to_owned())),
        };

        let months = translate(months, MONTH_ALIASES);
        let weekdays = translate(weekdays, WEEKDAY_ALIASES);

        Ok(Self {
            input: normalized.to_owned(),
            minutes: parse_field(minutes, "minutes", &domain(0, 59))?,
            hours: parse_field(hours, "hours", &domain(0, 23))?,
            days: parse_field(days, "days", &domain(1, 31))?,
            months: parse_field(&months, "months", &domain(1, 12))?,
            weekdays: parse_field(&weekdays, "weekdays", &domain(0, 6))?,
        })
    }

    /// Whether the expression matches the given instant's minute.
    pub fn is_now(&self, at: DateTime<Utc>) -> bool {
        self.minutes.contains(&at.minute())
            && self.hours.contains(&at.hour())
            && self.days.contains(&at.day())
            && self.months.contains(&at.month())
            && self.weekdays.contains(&at.weekday().num_days_from_sunday())
    }
}

fn parse_field(
    field: &str,
    name: &'static str,
    all: &BTreeSet<u32>,
) -> Result<BTreeSet<u32>, CronError> {
    let mut parsed = BTreeSet::new();

    for part in field.split(',').map(str::trim) {
        parsed.extend(parse_part(part, all)?);
    }

    if !parsed.is_subset(all) {
        return Err(CronError::OutOfRange {
            field: name,
            input: field.to_owned(),
        });
    }

    Ok(parsed)
}

fn parse_part(part: &str, all: &BTreeSet<u32>) -> Result<BTreeSet<u32>, CronError> {
    if part == "*" {
        Ok(all.clone())
    } else if LITERAL_RE.is_match(part) {
        parse_literal(part)
    } else if let Some(captures) = STEP_RE.captures(part) {
        let step = parse_number(&captures[1])?;
        Ok(step_set(all, step))
    } else if let Some(captures) = RANGE_STEP_RE.captures(part) {
        let range = parse_range(&captures[1], all)?;
        let step = parse_number(&captures[2])?;
        Ok(step_set(&range, step))
    } else if RANGE_RE.is_match(part) {
        parse_range(part, all)
    } else {
        Err(CronError::Unrecognized(part.to_owned()))
    }
}

fn parse_number(part: &str) -> Result<u32, CronError> {
    part.parse()
        .map_err(|_| CronError::Unrecognized(part.to_owned()))
}

fn parse_literal(part: &str) -> Result<BTreeSet<u32>, CronError> {
    Ok(BTreeSet::from([parse_number(part)?]))
}

/// Step ranges are calculated from the lowest value of the parent set.
fn step_set(all: &BTreeSet<u32>, step: u32) -> BTreeSet<u32> {
    match (all.first(), all.last()) {
        (Some(&min), Some(&max)) => (min..=max).step_by(step as usize).collect(),
        _ => BTreeSet::new(),
    }
}

fn parse_range(part: &str, all: &BTreeSet<u32>) -> Result<BTreeSet<u32>, CronError> {
    match part.split_once('-') {
        None => {
            let min = parse_number(part)?;
            let max = all.last().copied().unwrap_or(min);
            Ok(domain(min, max))
        }
        Some((min, max)) => {
            let min = parse_number(min)?;
            let max = parse_number(max)?;

            if min > max {
                return Err(CronError::InvertedRange { min, max });
            }

            Ok(domain(min, max))
        }
    }
}

/// A worker to enqueue on a schedule, keyed by `(worker, expression)`.
#[derive(Debug, Clone)]
pub struct CronEntry {
    pub expression: Expression,
    pub worker: String,
    pub queue: String,
    pub args: Value,
}

impl CronEntry {
    pub fn new(expression: &str, worker: impl Into<String>) -> Result<Self, CronError> {
        Ok(Self {
            expression: Expression::parse(expression)?,
            worker: worker.into(),
            queue: crate::job::DEFAULT_QUEUE.to_owned(),
            args: Value::Object(serde_json::Map::new()),
        })
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }
}

/// Leader-only loop that enqueues due cron entries once per minute. Leader
/// exclusivity is what keeps multiple nodes from double-enqueueing.
pub(crate) struct Scheduler {
    pub(crate) entries: Vec<CronEntry>,
    pub(crate) store: Store,
    pub(crate) leadership: Arc<Leadership>,
    pub(crate) shutdown: CancellationToken,
}

impl Scheduler {
    pub(crate) async fn run(self) {
        loop {
            let wait = time_to_next_minute(Utc::now());

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        if !self.leadership.is_leader() {
            return;
        }

        let now = Utc::now();

        let due: Vec<NewJob> = self
            .entries
            .iter()
            .filter(|entry| entry.expression.is_now(now))
            .map(|entry| {
                NewJob::new(&entry.worker, entry.args.clone())
                    .with_queue(&entry.queue)
                    .with_meta(json!({"cron": entry.expression.input}))
            })
            .collect();

        if due.is_empty() {
            return;
        }

        match self.store.insert_jobs(&due).await {
            Ok(jobs) => debug!(count = jobs.len(), "enqueued cron jobs"),
            Err(err) => error!(error = %err, "cron enqueue failed"),
        }
    }
}

/// Seconds until the next minute boundary, always in `(0, 60]`.
pub(crate) fn time_to_next_minute(now: DateTime<Utc>) -> Duration {
    let into_minute = f64::from(now.second()) + f64::from(now.timestamp_subsec_micros()) / 1e6;

    Duration::from_secs_f64((60.0 - into_minute).clamp(0.001, 60.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_parsing_simple_expressions() {
        assert!(Expression::parse("* * * * *").is_ok());
        assert!(matches!(
            Expression::parse("* * *"),
            Err(CronError::FieldCount(_))
        ));
    }

    #[test]
    fn test_parsing_nicknames() {
        let hourly = Expression::parse("@hourly").unwrap();
        assert_eq!(hourly.minutes, BTreeSet::from([0]));
        assert_eq!(hourly.hours, domain(0, 23));
        assert_eq!(hourly.days, domain(1, 31));
        assert_eq!(hourly.months, domain(1, 12));
        assert_eq!(hourly.weekdays, domain(0, 6));

        assert_eq!(
            Expression::parse("@daily").unwrap().hours,
            BTreeSet::from([0])
        );
        assert_eq!(
            Expression::parse("@monthly").unwrap().days,
            BTreeSet::from([1])
        );
        assert_eq!(
            Expression::parse("@weekly").unwrap().weekdays,
            BTreeSet::from([0])
        );
    }

    #[test]
    fn test_parsing_month_aliases() {
        assert_eq!(
            Expression::parse("* * * JAN *").unwrap().months,
            BTreeSet::from([1])
        );
        assert_eq!(
            Expression::parse("* * * JUN,JUL *").unwrap().months,
            BTreeSet::from([6, 7])
        );
    }

    #[test]
    fn test_parsing_weekday_aliases() {
        assert_eq!(
            Expression::parse("* * * * MON").unwrap().weekdays,
            BTreeSet::from([1])
        );
        assert_eq!(
            Expression::parse("* * * * SUN,TUE").unwrap().weekdays,
            BTreeSet::from([0, 2])
        );
    }

    #[test]
    fn test_parsing_upper_bounds() {
        assert!(Expression::parse("59 23 31 12 6").is_ok());
    }

    #[test]
    fn test_parsing_out_of_bounds() {
        for input in [
            "60 * * * *",
            "* 24 * * *",
            "* * 32 * *",
            "* * * 13 *",
            "* * * * 7",
        ] {
            assert!(
                matches!(
                    Expression::parse(input),
                    Err(CronError::OutOfRange { .. })
                ),
                "expected {input} to be out of range"
            );
        }
    }

    #[test]
    fn test_parsing_unrecognized_expressions() {
        for input in ["*/0 * * * *", "ONE * * * *", "* * * jan *", "* * * * sun"] {
            assert!(
                Expression::parse(input).is_err(),
                "expected {input} to fail"
            );
        }
    }

    #[test]
    fn test_step_ranges_are_calculated_from_lowest_value() {
        assert_eq!(
            Expression::parse("* 0/12 * * *").unwrap().hours,
            BTreeSet::from([0, 12])
        );
        assert_eq!(
            Expression::parse("* 1/7 * * *").unwrap().hours,
            BTreeSet::from([1, 8, 15, 22])
        );
        assert_eq!(
            Expression::parse("* 1-14/7 * * *").unwrap().hours,
            BTreeSet::from([1, 8])
        );
    }

    #[test]
    fn test_inverted_ranges_are_rejected() {
        assert!(matches!(
            Expression::parse("30-10 * * * *"),
            Err(CronError::InvertedRange { min: 30, max: 10 })
        ));
    }

    #[test]
    fn test_is_now_matches_literal_values() {
        let expr = Expression::parse("34 12 15 6 *").unwrap();
        let time = utc(2025, 6, 15, 12, 34, 0);

        assert!(expr.is_now(time));
        assert!(!expr.is_now(utc(2025, 6, 15, 12, 33, 0)));
        assert!(!expr.is_now(utc(2025, 6, 15, 11, 34, 0)));
        assert!(!expr.is_now(utc(2025, 6, 14, 12, 34, 0)));
        assert!(!expr.is_now(utc(2025, 5, 15, 12, 34, 0)));
    }

    #[test]
    fn test_is_now_matches_literal_weekdays() {
        // 2025-10-12 is a Sunday
        let sunday = utc(2025, 10, 12, 8, 0, 0);

        assert!(Expression::parse("* * * * SUN").unwrap().is_now(sunday));
        assert!(!Expression::parse("* * * * MON").unwrap().is_now(sunday));
    }

    #[test]
    fn test_seconds_until_next_minute() {
        assert_eq!(time_to_next_minute(utc(2025, 1, 1, 12, 34, 0)).as_secs_f64(), 60.0);
        assert_eq!(time_to_next_minute(utc(2025, 1, 1, 12, 34, 1)).as_secs_f64(), 59.0);
        assert_eq!(time_to_next_minute(utc(2025, 1, 1, 12, 34, 30)).as_secs_f64(), 30.0);
        assert_eq!(time_to_next_minute(utc(2025, 1, 1, 23, 59, 59)).as_secs_f64(), 1.0);
    }

    #[test]
    fn test_time_to_next_minute_is_always_positive_and_bounded() {
        for second in [0, 15, 30, 45, 59] {
            let wait = time_to_next_minute(utc(2025, 1, 1, 12, 0, second));

            assert!(wait.as_secs_f64() > 0.0);
            assert!(wait.as_secs_f64() <= 60.0);
        }
    }
}
