//! 14-digit `YYYYMMDDhhmmss` capture timestamps.
//!
//! Capture keys embed timestamps in this form so that byte order equals time
//! order. Query bounds may be given with less precision (`2020`, `202002`,
//! ...) and are widened to the first or last second of the period they name.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

/// Number of digits in a full-precision timestamp.
pub const TIMESTAMP_LEN: usize = 14;

const FORMAT: &str = "%Y%m%d%H%M%S";

/// Reasons a timestamp string is not acceptable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    #[error("timestamp {0:?} must have 4, 6, 8, 10, 12 or 14 digits")]
    BadLength(String),
    #[error("timestamp {0:?} contains characters other than digits")]
    NotDigits(String),
    #[error("timestamp {0:?} does not name a valid date and time")]
    OutOfRange(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precision {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

/// Format an instant as a 14-digit timestamp.
pub fn format(instant: &DateTime<Utc>) -> String {
    instant.format(FORMAT).to_string()
}

/// Parse a full 14-digit timestamp.
pub fn parse(timestamp: &str) -> Result<DateTime<Utc>, TimestampError> {
    if timestamp.len() != TIMESTAMP_LEN {
        return Err(TimestampError::BadLength(timestamp.to_owned()));
    }
    let (start, _) = period_start(timestamp)?;
    Ok(Utc.from_utc_datetime(&start))
}

/// Seconds since the epoch of a full 14-digit timestamp.
pub fn seconds(timestamp: &str) -> Result<i64, TimestampError> {
    parse(timestamp).map(|t| t.timestamp())
}

/// Widen a partial timestamp to the first second of the period it names.
///
/// `2020` becomes `20200101000000`.
pub fn pad_lower(partial: &str) -> Result<String, TimestampError> {
    let (start, _) = period_start(partial)?;
    Ok(start.format(FORMAT).to_string())
}

/// Widen a partial timestamp to the last second of the period it names.
///
/// `202002` becomes `20200229235959`.
pub fn pad_upper(partial: &str) -> Result<String, TimestampError> {
    let (start, precision) = period_start(partial)?;
    let out_of_range = || TimestampError::OutOfRange(partial.to_owned());

    let next = match precision {
        Precision::Year => first_of_month(start.date().year_ce() + 1, 1),
        Precision::Month => {
            let (year, month) = (start.date().year_ce(), start.date().month_ce());
            if month == 12 {
                first_of_month(year + 1, 1)
            } else {
                first_of_month(year, month + 1)
            }
        }
        Precision::Day => start.checked_add_signed(Duration::days(1)),
        Precision::Hour => start.checked_add_signed(Duration::hours(1)),
        Precision::Minute => start.checked_add_signed(Duration::minutes(1)),
        Precision::Second => return Ok(start.format(FORMAT).to_string()),
    }
    .ok_or_else(out_of_range)?;

    let end = next
        .checked_sub_signed(Duration::seconds(1))
        .ok_or_else(out_of_range)?;
    Ok(end.format(FORMAT).to_string())
}

fn first_of_month(year: i32, month: u32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn period_start(partial: &str) -> Result<(NaiveDateTime, Precision), TimestampError> {
    let precision = match partial.len() {
        4 => Precision::Year,
        6 => Precision::Month,
        8 => Precision::Day,
        10 => Precision::Hour,
        12 => Precision::Minute,
        14 => Precision::Second,
        _ => return Err(TimestampError::BadLength(partial.to_owned())),
    };
    if !partial.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TimestampError::NotDigits(partial.to_owned()));
    }

    // Missing components default to the start of their unit.
    let component = |start: usize, default: u32| -> u32 {
        partial
            .get(start..start + 2)
            .and_then(|digits| digits.parse().ok())
            .unwrap_or(default)
    };
    let year: i32 = partial[..4]
        .parse()
        .map_err(|_| TimestampError::NotDigits(partial.to_owned()))?;

    let start = NaiveDate::from_ymd_opt(year, component(4, 1), component(6, 1))
        .and_then(|date| date.and_hms_opt(component(8, 0), component(10, 0), component(12, 0)))
        .ok_or_else(|| TimestampError::OutOfRange(partial.to_owned()))?;
    Ok((start, precision))
}

trait CivilDate {
    fn year_ce(&self) -> i32;
    fn month_ce(&self) -> u32;
}

impl CivilDate for NaiveDate {
    fn year_ce(&self) -> i32 {
        chrono::Datelike::year(self)
    }

    fn month_ce(&self) -> u32 {
        chrono::Datelike::month(self)
    }
}
