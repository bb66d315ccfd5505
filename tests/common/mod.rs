#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dsm::{
    Bar, BarSource, FcpConfig, Interval, MarketType, RetryConfig, SourceError, SourceErrorKind,
    SourceRequest, SourceTag,
};

pub fn ts_ms(year: i32, month: u32, day: u32, hour: u32) -> i64 {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
        .single()
        .expect("valid UTC timestamp")
        .timestamp_millis()
}

/// Wall clock for every manager under test: 2024-03-10 12:00 UTC.
pub fn fixed_now() -> i64 {
    ts_ms(2024, 3, 10, 12)
}

pub fn test_config(cache_root: &Path) -> FcpConfig {
    FcpConfig {
        cache_root: cache_root.to_path_buf(),
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        },
        request_deadline: Duration::from_secs(10),
        grace_period: Duration::from_millis(200),
        ..FcpConfig::default()
    }
}

pub fn synthetic_bar(open_time_ms: i64) -> Bar {
    let base = 100.0 + (open_time_ms / 3_600_000 % 50) as f64;
    Bar {
        open_time_ms,
        open: base,
        high: base + 2.0,
        low: base - 1.0,
        close: base + 0.5,
        volume: 10.0,
    }
}

#[derive(Debug, Clone)]
pub enum Behavior {
    Synthetic,
    Fail(SourceErrorKind),
    /// Fails the first `n` calls, then serves synthetic bars.
    FailTimes(usize, SourceErrorKind),
    /// Never resolves.
    Hang,
    /// Synthetic bars except these open times.
    Missing(Vec<i64>),
    /// No bars before the given open time.
    ListingFrom(i64),
}

pub struct MockSource {
    tag: SourceTag,
    behavior: Behavior,
    delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<SourceRequest>>,
}

impl MockSource {
    pub fn bulk(behavior: Behavior) -> Self {
        Self::new(SourceTag::BulkHistorical, behavior)
    }

    pub fn live(behavior: Behavior) -> Self {
        Self::new(SourceTag::Live, behavior)
    }

    fn new(tag: SourceTag, behavior: Behavior) -> Self {
        Self {
            tag,
            behavior,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SourceRequest> {
        self.requests
            .lock()
            .expect("requests lock should not be poisoned")
            .clone()
    }
}

#[async_trait]
impl BarSource for MockSource {
    fn tag(&self) -> SourceTag {
        self.tag
    }

    fn supports(&self, market: MarketType, interval: Interval) -> bool {
        match self.tag {
            SourceTag::BulkHistorical => {
                market.supports_interval(interval) && interval.fits_calendar_day()
            }
            _ => market.supports_interval(interval),
        }
    }

    fn max_rows_per_call(&self, _market: MarketType, interval: Interval) -> u64 {
        match self.tag {
            SourceTag::BulkHistorical => interval.bars_per_day().unwrap_or(1),
            _ => 1_000,
        }
    }

    async fn fetch(&self, req: &SourceRequest) -> Result<Vec<Bar>, SourceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("requests lock should not be poisoned")
            .push(req.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let opens = req.interval.boundaries(req.range);
        match &self.behavior {
            Behavior::Synthetic => Ok(opens.map(synthetic_bar).collect()),
            Behavior::Fail(kind) => Err(SourceError::new(kind.clone(), "scripted failure")),
            Behavior::FailTimes(n, kind) if call < *n => {
                Err(SourceError::new(kind.clone(), format!("scripted failure {call}")))
            }
            Behavior::FailTimes(..) => Ok(opens.map(synthetic_bar).collect()),
            Behavior::Hang => std::future::pending().await,
            Behavior::Missing(skip) => Ok(opens
                .filter(|open| !skip.contains(open))
                .map(synthetic_bar)
                .collect()),
            Behavior::ListingFrom(first) => Ok(opens
                .filter(|open| open >= first)
                .map(synthetic_bar)
                .collect()),
        }
    }
}
