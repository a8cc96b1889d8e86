//! Commission periods.
//!
//! A period key names a fixed UTC window: `"2024-10"` is the calendar month, `"2024-W42"` the
//! ISO week. Every calculation of a run reads data bounded by this window so re-running a past
//! period is deterministic.

use crate::{McreError, Result};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Weekly,
    Monthly,
}

impl RunType {
    pub fn as_str(self) -> &'static str {
        match self {
            RunType::Weekly => "weekly",
            RunType::Monthly => "monthly",
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PeriodKey {
    Month { year: i32, month: u32 },
    IsoWeek { year: i32, week: u32 },
}

impl PeriodKey {
    pub fn month(year: i32, month: u32) -> Result<PeriodKey> {
        let key = PeriodKey::Month { year, month };
        key.window()?;
        Ok(key)
    }

    pub fn iso_week(year: i32, week: u32) -> Result<PeriodKey> {
        let key = PeriodKey::IsoWeek { year, week };
        key.window()?;
        Ok(key)
    }

    /// The run type this key can be executed under.
    pub fn run_type(&self) -> RunType {
        match self {
            PeriodKey::Month { .. } => RunType::Monthly,
            PeriodKey::IsoWeek { .. } => RunType::Weekly,
        }
    }

    /// Calendar year the period belongs to (ISO year for weeks).
    pub fn year(&self) -> i32 {
        match *self {
            PeriodKey::Month { year, .. } | PeriodKey::IsoWeek { year, .. } => year,
        }
    }

    /// Half-open UTC window `[start, end)`.
    pub fn window(&self) -> Result<PeriodWindow> {
        let (start, end) = match *self {
            PeriodKey::Month { year, month } => {
                let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| {
                    McreError::Validation(format!("invalid month period {year}-{month:02}"))
                })?;
                let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
                let end = NaiveDate::from_ymd_opt(ny, nm, 1).ok_or_else(|| {
                    McreError::Validation(format!("invalid month period {year}-{month:02}"))
                })?;
                (start, end)
            }
            PeriodKey::IsoWeek { year, week } => {
                let start = NaiveDate::from_isoywd_opt(year, week, Weekday::Mon).ok_or_else(
                    || McreError::Validation(format!("invalid ISO week {year}-W{week:02}")),
                )?;
                (start, start + Duration::days(7))
            }
        };
        Ok(PeriodWindow {
            start: midnight_utc(start),
            end: midnight_utc(end),
        })
    }
}

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PeriodKey::Month { year, month } => write!(f, "{year:04}-{month:02}"),
            PeriodKey::IsoWeek { year, week } => write!(f, "{year:04}-W{week:02}"),
        }
    }
}

impl FromStr for PeriodKey {
    type Err = McreError;

    fn from_str(s: &str) -> Result<PeriodKey> {
        let invalid = || McreError::Validation(format!("invalid period key: {s:?}"));
        let (year, rest) = s.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        match rest.strip_prefix('W') {
            Some(week) if week.len() == 2 => {
                let week: u32 = week.parse().map_err(|_| invalid())?;
                PeriodKey::iso_week(year, week)
            }
            None if rest.len() == 2 => {
                let month: u32 = rest.parse().map_err(|_| invalid())?;
                PeriodKey::month(year, month)
            }
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for PeriodKey {
    type Error = McreError;
    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeriodKey> for String {
    fn from(key: PeriodKey) -> String {
        key.to_string()
    }
}

/// Half-open UTC interval `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PeriodWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Idempotency key of a commission run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub run_type: RunType,
    pub period: PeriodKey,
}

impl RunKey {
    /// Validates that `period` matches `run_type`.
    pub fn new(run_type: RunType, period: PeriodKey) -> Result<RunKey> {
        if period.run_type() != run_type {
            return Err(McreError::Validation(format!(
                "period {period} cannot be used for a {run_type} run"
            )));
        }
        Ok(RunKey { run_type, period })
    }

    pub fn parse(run_type: RunType, period: &str) -> Result<RunKey> {
        RunKey::new(run_type, period.parse()?)
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.run_type, self.period)
    }
}

/// Whole days in `[a, b)`, floored; negative when `b < a`.
pub fn whole_days_between(a: DateTime<Utc>, b: DateTime<Utc>) -> i64 {
    (b - a).num_days()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_monthly_and_weekly_keys() {
        assert_eq!(
            "2024-10".parse::<PeriodKey>().unwrap(),
            PeriodKey::Month { year: 2024, month: 10 }
        );
        assert_eq!(
            "2024-W42".parse::<PeriodKey>().unwrap(),
            PeriodKey::IsoWeek { year: 2024, week: 42 }
        );
        assert!("2024-13".parse::<PeriodKey>().is_err());
        assert!("2024-W54".parse::<PeriodKey>().is_err());
        assert!("24-10".parse::<PeriodKey>().is_err());
        assert!("2024/10".parse::<PeriodKey>().is_err());
    }

    #[test]
    fn month_window_is_half_open() {
        let w = PeriodKey::month(2024, 12).unwrap().window().unwrap();
        assert_eq!(w.start, Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(w.end, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert!(w.contains(w.start));
        assert!(!w.contains(w.end));
    }

    #[test]
    fn iso_week_window_starts_monday() {
        let w = PeriodKey::iso_week(2024, 1).unwrap().window().unwrap();
        assert_eq!(w.start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(w.end - w.start, Duration::days(7));
    }

    #[test]
    fn run_key_rejects_mismatched_period() {
        assert!(RunKey::parse(RunType::Monthly, "2024-10").is_ok());
        assert!(RunKey::parse(RunType::Weekly, "2024-10").is_err());
        assert!(RunKey::parse(RunType::Monthly, "2024-W03").is_err());
    }

    #[test]
    fn period_key_serializes_as_string() {
        let key = PeriodKey::iso_week(2024, 7).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"2024-W07\"");
        let back: PeriodKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
