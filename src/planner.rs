//! Request validation and cache-aware fetch planning.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::debug;

use crate::interval::{
    adjust_request_window, day_ceiling, day_floor, day_range, days_in, utc_day, Interval,
};
use crate::model::{MarketType, SourceTag, TimeRange};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanningError {
    #[error("symbol must not be empty")]
    EmptySymbol,
    #[error("invalid timestamp {0}")]
    InvalidTimestamp(i64),
    #[error("range [{start_ms}, {end_ms}) holds no closed {interval} bars")]
    EmptyRange {
        start_ms: i64,
        end_ms: i64,
        interval: Interval,
    },
    #[error("interval {interval} is not offered for {market}")]
    UnsupportedInterval {
        market: MarketType,
        interval: Interval,
    },
    #[error("{tag} source cannot serve {market} {interval}")]
    SourceUnsupported {
        tag: SourceTag,
        market: MarketType,
        interval: Interval,
    },
}

/// Validates a raw request and returns its aligned window, with the end
/// clamped so the still-open bar at `now_ms` is never requested.
pub fn prepare_window(
    symbol: &str,
    market: MarketType,
    interval: Interval,
    start_ms: i64,
    end_ms: i64,
    now_ms: i64,
) -> Result<TimeRange, PlanningError> {
    if symbol.trim().is_empty() {
        return Err(PlanningError::EmptySymbol);
    }
    for ts in [start_ms, end_ms] {
        if ts < 0 || utc_day(ts).is_none() {
            return Err(PlanningError::InvalidTimestamp(ts));
        }
    }
    if !market.supports_interval(interval) {
        return Err(PlanningError::UnsupportedInterval { market, interval });
    }

    let empty = PlanningError::EmptyRange {
        start_ms,
        end_ms,
        interval,
    };
    if end_ms <= start_ms {
        return Err(empty);
    }

    let adjusted = adjust_request_window(start_ms, end_ms, interval);
    let window = TimeRange::new(
        adjusted.start_ms,
        adjusted.end_ms.min(interval.floor(now_ms)),
    );
    if window.is_empty() {
        return Err(empty);
    }
    Ok(window)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlannedFetch {
    pub range: TimeRange,
    pub source: SourceTag,
}

/// Ordered fetches plus the sub-ranges already satisfied by cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    pub requested: TimeRange,
    pub cached: Vec<TimeRange>,
    pub fetches: Vec<PlannedFetch>,
    /// First millisecond the bulk source is not expected to cover yet.
    pub freshness_boundary_ms: i64,
}

impl FetchPlan {
    pub fn is_fully_cached(&self) -> bool {
        self.fetches.is_empty()
    }
}

pub fn freshness_boundary(now_ms: i64, freshness_delay: Duration) -> i64 {
    let delay_ms = i64::try_from(freshness_delay.as_millis()).unwrap_or(i64::MAX);
    day_floor(now_ms.saturating_sub(delay_ms))
}

/// Splits `requested` into cached days and missing spans, routing each
/// missing span to the bulk or live source.
pub fn plan_fetch(
    requested: TimeRange,
    interval: Interval,
    cached_days: &BTreeSet<NaiveDate>,
    bulk_supported: bool,
    now_ms: i64,
    freshness_delay: Duration,
) -> FetchPlan {
    let boundary = freshness_boundary(now_ms, freshness_delay);
    let (cached, gaps) = split_cached(requested, cached_days);

    let mut fetches = Vec::new();
    for gap in gaps {
        if !bulk_supported {
            fetches.push(PlannedFetch {
                range: gap,
                source: SourceTag::Live,
            });
            continue;
        }

        if gap.start_ms < boundary {
            let bulk_end = gap.end_ms.min(boundary);
            fetches.push(PlannedFetch {
                range: TimeRange::new(day_floor(gap.start_ms), day_ceiling(bulk_end)),
                source: SourceTag::BulkHistorical,
            });
        }
        if gap.end_ms > boundary {
            fetches.push(PlannedFetch {
                range: TimeRange::new(gap.start_ms.max(boundary), gap.end_ms),
                source: SourceTag::Live,
            });
        }
    }

    let plan = FetchPlan {
        requested,
        cached,
        fetches,
        freshness_boundary_ms: boundary,
    };
    debug!(
        component = "planner",
        event = "dsm.plan.built",
        interval = interval.as_str(),
        requested = %requested,
        cached_ranges = plan.cached.len(),
        fetches = plan.fetches.len(),
        freshness_boundary_ms = boundary
    );
    plan
}

/// Plan for a caller that pinned one source and bypasses failover.
#[allow(clippy::too_many_arguments)]
pub fn plan_enforced(
    requested: TimeRange,
    market: MarketType,
    interval: Interval,
    tag: SourceTag,
    cached_days: &BTreeSet<NaiveDate>,
    bulk_supported: bool,
    now_ms: i64,
    freshness_delay: Duration,
) -> Result<FetchPlan, PlanningError> {
    let boundary = freshness_boundary(now_ms, freshness_delay);
    let plan = match tag {
        SourceTag::Cache => {
            let (cached, _) = split_cached(requested, cached_days);
            FetchPlan {
                requested,
                cached,
                fetches: Vec::new(),
                freshness_boundary_ms: boundary,
            }
        }
        SourceTag::BulkHistorical if !bulk_supported => {
            return Err(PlanningError::SourceUnsupported {
                tag,
                market,
                interval,
            });
        }
        SourceTag::BulkHistorical => FetchPlan {
            requested,
            cached: Vec::new(),
            fetches: vec![PlannedFetch {
                range: TimeRange::new(
                    day_floor(requested.start_ms),
                    day_ceiling(requested.end_ms),
                ),
                source: tag,
            }],
            freshness_boundary_ms: boundary,
        },
        SourceTag::Live => FetchPlan {
            requested,
            cached: Vec::new(),
            fetches: vec![PlannedFetch {
                range: requested,
                source: tag,
            }],
            freshness_boundary_ms: boundary,
        },
    };
    Ok(plan)
}

fn split_cached(
    requested: TimeRange,
    cached_days: &BTreeSet<NaiveDate>,
) -> (Vec<TimeRange>, Vec<TimeRange>) {
    let mut cached: Vec<TimeRange> = Vec::new();
    let mut gaps: Vec<TimeRange> = Vec::new();

    for day in days_in(requested) {
        let Some(part) = day_range(day).intersect(&requested) else {
            continue;
        };
        let target = if cached_days.contains(&day) {
            &mut cached
        } else {
            &mut gaps
        };
        match target.last_mut() {
            Some(last) if last.end_ms == part.start_ms => last.end_ms = part.end_ms,
            _ => target.push(part),
        }
    }

    (cached, gaps)
}
