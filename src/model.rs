//! Core value types shared by the planner, coordinator, cache and merge.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::interval::Interval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Binance,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binance => "binance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    Spot,
    /// USDT-margined perpetuals (UM).
    FuturesUsdt,
    /// Coin-margined perpetuals (CM).
    FuturesCoin,
}

impl MarketType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::FuturesUsdt => "futures_usdt",
            Self::FuturesCoin => "futures_coin",
        }
    }

    /// Whether the exchange publishes klines at this interval for the market at all.
    pub fn supports_interval(self, interval: Interval) -> bool {
        match self {
            Self::Spot => true,
            Self::FuturesUsdt | Self::FuturesCoin => interval != Interval::Sec1,
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "spot" => Ok(Self::Spot),
            "futures_usdt" | "um" | "usdm" => Ok(Self::FuturesUsdt),
            "futures_coin" | "cm" | "coinm" => Ok(Self::FuturesCoin),
            other => Err(format!("unknown market type '{other}'")),
        }
    }
}

/// Provenance of a bar. Declaration order is merge priority: earlier wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    Cache,
    BulkHistorical,
    Live,
}

impl SourceTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::BulkHistorical => "bulk_historical",
            Self::Live => "live",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceTag {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cache" => Ok(Self::Cache),
            "bulk" | "bulk_historical" | "vision" => Ok(Self::BulkHistorical),
            "live" | "rest" => Ok(Self::Live),
            other => Err(format!("unknown source '{other}'")),
        }
    }
}

/// Half-open `[start_ms, end_ms)` window of UTC milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TimeRange {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeRange {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn is_empty(&self) -> bool {
        self.end_ms <= self.start_ms
    }

    pub fn contains(&self, ts_ms: i64) -> bool {
        ts_ms >= self.start_ms && ts_ms < self.end_ms
    }

    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let clipped = TimeRange::new(
            self.start_ms.max(other.start_ms),
            self.end_ms.min(other.end_ms),
        );
        (!clipped.is_empty()).then_some(clipped)
    }

    pub fn covers(&self, other: &TimeRange) -> bool {
        self.start_ms <= other.start_ms && other.end_ms <= self.end_ms
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start_ms, self.end_ms)
    }
}

/// One OHLCV candle keyed by its interval-aligned open time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bar {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn is_valid(&self) -> bool {
        [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|value| value.is_finite())
            && self.high >= self.low
            && self.volume >= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourcedBar {
    pub bar: Bar,
    pub source: SourceTag,
}

impl SourcedBar {
    pub fn new(bar: Bar, source: SourceTag) -> Self {
        Self { bar, source }
    }

    pub fn open_time_ms(&self) -> i64 {
        self.bar.open_time_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_priority_follows_declaration_order() {
        let mut tags = vec![SourceTag::Live, SourceTag::Cache, SourceTag::BulkHistorical];
        tags.sort();
        assert_eq!(
            tags,
            vec![SourceTag::Cache, SourceTag::BulkHistorical, SourceTag::Live]
        );
    }

    #[test]
    fn range_intersection_is_half_open() {
        let a = TimeRange::new(0, 10);
        assert_eq!(a.intersect(&TimeRange::new(5, 20)), Some(TimeRange::new(5, 10)));
        assert_eq!(a.intersect(&TimeRange::new(10, 20)), None);
        assert!(a.covers(&TimeRange::new(2, 10)));
        assert!(!a.contains(10));
    }

    #[test]
    fn bar_validity_rejects_inverted_high_low_and_negative_volume() {
        let bar = Bar {
            open_time_ms: 0,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 3.0,
        };
        assert!(bar.is_valid());
        assert!(!Bar { high: 0.1, ..bar }.is_valid());
        assert!(!Bar { volume: -1.0, ..bar }.is_valid());
        assert!(!Bar { close: f64::NAN, ..bar }.is_valid());
    }

    #[test]
    fn market_and_source_parse_aliases() {
        assert_eq!("UM".parse::<MarketType>().unwrap(), MarketType::FuturesUsdt);
        assert_eq!("vision".parse::<SourceTag>().unwrap(), SourceTag::BulkHistorical);
        assert!("bogus".parse::<SourceTag>().is_err());
        assert!(!MarketType::FuturesCoin.supports_interval(Interval::Sec1));
    }
}
