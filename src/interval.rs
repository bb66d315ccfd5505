//! Interval boundary arithmetic over UTC millisecond timestamps.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime};
use serde::{Serialize, Serializer};

use crate::model::TimeRange;

pub const SECOND_MS: i64 = 1_000;
pub const MINUTE_MS: i64 = 60 * SECOND_MS;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

// 1970-01-01 was a Thursday; exchange weeks open on Monday 00:00 UTC.
const WEEK_ANCHOR_MS: i64 = 4 * DAY_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Interval {
    Sec1,
    Min1,
    Min3,
    Min5,
    Min15,
    Min30,
    Hour1,
    Hour2,
    Hour4,
    Hour6,
    Hour8,
    Hour12,
    Day1,
    Day3,
    Week1,
    Month1,
}

impl Interval {
    pub const ALL: [Interval; 16] = [
        Self::Sec1,
        Self::Min1,
        Self::Min3,
        Self::Min5,
        Self::Min15,
        Self::Min30,
        Self::Hour1,
        Self::Hour2,
        Self::Hour4,
        Self::Hour6,
        Self::Hour8,
        Self::Hour12,
        Self::Day1,
        Self::Day3,
        Self::Week1,
        Self::Month1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sec1 => "1s",
            Self::Min1 => "1m",
            Self::Min3 => "3m",
            Self::Min5 => "5m",
            Self::Min15 => "15m",
            Self::Min30 => "30m",
            Self::Hour1 => "1h",
            Self::Hour2 => "2h",
            Self::Hour4 => "4h",
            Self::Hour6 => "6h",
            Self::Hour8 => "8h",
            Self::Hour12 => "12h",
            Self::Day1 => "1d",
            Self::Day3 => "3d",
            Self::Week1 => "1w",
            Self::Month1 => "1M",
        }
    }

    fn fixed_ms(self) -> Option<i64> {
        match self {
            Self::Sec1 => Some(SECOND_MS),
            Self::Min1 => Some(MINUTE_MS),
            Self::Min3 => Some(3 * MINUTE_MS),
            Self::Min5 => Some(5 * MINUTE_MS),
            Self::Min15 => Some(15 * MINUTE_MS),
            Self::Min30 => Some(30 * MINUTE_MS),
            Self::Hour1 => Some(HOUR_MS),
            Self::Hour2 => Some(2 * HOUR_MS),
            Self::Hour4 => Some(4 * HOUR_MS),
            Self::Hour6 => Some(6 * HOUR_MS),
            Self::Hour8 => Some(8 * HOUR_MS),
            Self::Hour12 => Some(12 * HOUR_MS),
            Self::Day1 => Some(DAY_MS),
            Self::Day3 => Some(3 * DAY_MS),
            Self::Week1 => Some(7 * DAY_MS),
            Self::Month1 => None,
        }
    }

    fn anchor_ms(self) -> i64 {
        match self {
            Self::Week1 => WEEK_ANCHOR_MS,
            _ => 0,
        }
    }

    /// Length used for sizing decisions; a month counts as 30 days.
    pub fn nominal_ms(self) -> i64 {
        self.fixed_ms().unwrap_or(30 * DAY_MS)
    }

    /// True when a UTC calendar day holds a whole number of bars.
    pub fn fits_calendar_day(self) -> bool {
        self.bars_per_day().is_some()
    }

    pub fn bars_per_day(self) -> Option<u64> {
        self.fixed_ms()
            .filter(|len| DAY_MS % len == 0)
            .map(|len| (DAY_MS / len) as u64)
    }

    /// Largest boundary `<= ts_ms`.
    pub fn floor(self, ts_ms: i64) -> i64 {
        match self.fixed_ms() {
            Some(len) => {
                let anchor = self.anchor_ms();
                (ts_ms - anchor).div_euclid(len) * len + anchor
            }
            None => month_floor(ts_ms),
        }
    }

    /// Smallest boundary `>= ts_ms`.
    pub fn ceiling(self, ts_ms: i64) -> i64 {
        let floored = self.floor(ts_ms);
        if floored == ts_ms {
            ts_ms
        } else {
            self.next_boundary(floored)
        }
    }

    pub fn is_aligned(self, ts_ms: i64) -> bool {
        self.floor(ts_ms) == ts_ms
    }

    pub fn next_boundary(self, open_ms: i64) -> i64 {
        self.advance(open_ms, 1)
    }

    /// Moves an aligned open time forward by `steps` bars.
    pub fn advance(self, open_ms: i64, steps: u64) -> i64 {
        match self.fixed_ms() {
            Some(len) => {
                let steps = i64::try_from(steps).unwrap_or(i64::MAX);
                open_ms.saturating_add(len.saturating_mul(steps))
            }
            None => add_months(open_ms, steps),
        }
    }

    /// Last millisecond covered by the bar opening at (the floor of) `open_ms`.
    pub fn close_time(self, open_ms: i64) -> i64 {
        self.next_boundary(self.floor(open_ms)) - 1
    }

    /// Number of bar open times inside `[start_ms, end_ms)`.
    pub fn expected_count(self, start_ms: i64, end_ms: i64) -> u64 {
        let first = self.ceiling(start_ms);
        if first >= end_ms {
            return 0;
        }
        match self.fixed_ms() {
            Some(len) => ((end_ms - 1 - first) / len + 1) as u64,
            None => self.boundaries(TimeRange::new(first, end_ms)).count() as u64,
        }
    }

    /// Every bar open time inside the range, ascending.
    pub fn boundaries(self, range: TimeRange) -> impl Iterator<Item = i64> {
        let end = range.end_ms;
        let first = Some(self.ceiling(range.start_ms)).filter(|first| *first < end);
        std::iter::successors(first, move |&current| {
            let next = self.next_boundary(current);
            (next > current && next < end).then_some(next)
        })
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        Self::ALL
            .into_iter()
            .find(|interval| interval.as_str() == trimmed)
            .ok_or_else(|| format!("unknown interval '{trimmed}'"))
    }
}

/// Aligns a requested window: start floored, end floored and exclusive, so a
/// still-open candle is never included and no closed candle is dropped.
pub fn adjust_request_window(start_ms: i64, end_ms: i64, interval: Interval) -> TimeRange {
    TimeRange::new(interval.floor(start_ms), interval.floor(end_ms))
}

pub fn utc_day(ts_ms: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(ts_ms).map(|dt| dt.date_naive())
}

pub fn day_start_ms(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

pub fn day_range(date: NaiveDate) -> TimeRange {
    let start = day_start_ms(date);
    TimeRange::new(start, start + DAY_MS)
}

pub fn day_floor(ts_ms: i64) -> i64 {
    ts_ms.div_euclid(DAY_MS) * DAY_MS
}

pub fn day_ceiling(ts_ms: i64) -> i64 {
    let floored = day_floor(ts_ms);
    if floored == ts_ms {
        ts_ms
    } else {
        floored + DAY_MS
    }
}

/// UTC calendar days intersecting the range, ascending.
pub fn days_in(range: TimeRange) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    if range.is_empty() {
        return out;
    }
    let Some(mut day) = utc_day(range.start_ms) else {
        return out;
    };
    while day_start_ms(day) < range.end_ms {
        out.push(day);
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    out
}

fn month_floor(ts_ms: i64) -> i64 {
    utc_day(ts_ms)
        .and_then(|date| NaiveDate::from_ymd_opt(date.year(), date.month(), 1))
        .map(day_start_ms)
        .unwrap_or(ts_ms)
}

fn add_months(ts_ms: i64, months: u64) -> i64 {
    let months = Months::new(u32::try_from(months).unwrap_or(u32::MAX));
    utc_day(month_floor(ts_ms))
        .and_then(|first| first.checked_add_months(months))
        .map(day_start_ms)
        .unwrap_or(i64::MAX)
}
