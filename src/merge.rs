//! Reconciles cached and fetched bars into one ordered, gap-annotated series.

use std::collections::HashSet;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache_store::Completeness;
use crate::interval::{day_floor, day_range, days_in, Interval, DAY_MS};
use crate::model::{Bar, SourcedBar, TimeRange};

pub const MAX_REPORTED_GAP_RANGES: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoverageReport {
    pub expected_points: u64,
    pub actual_points: u64,
    pub missing_points: u64,
    pub duplicate_points_removed: u64,
    pub boundary_tick_gaps: u64,
    pub total_gap_ranges: u64,
    /// Inclusive `(first_missing_open, last_missing_open)` pairs, capped.
    pub gap_ranges: Vec<(i64, i64)>,
}

impl CoverageReport {
    pub fn is_complete(&self) -> bool {
        self.missing_points == 0
    }
}

/// A residual gap that no known upstream artifact explains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeInconsistency {
    pub range: TimeRange,
    pub missing_bars: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutput {
    pub bars: Vec<SourcedBar>,
    pub coverage: CoverageReport,
    pub inconsistencies: Vec<MergeInconsistency>,
}

pub fn merge_sourced(
    requested: TimeRange,
    interval: Interval,
    mut bars: Vec<SourcedBar>,
    tolerate_boundary_ticks: bool,
) -> MergeOutput {
    let before = bars.len();
    bars.retain(|item| {
        requested.contains(item.open_time_ms())
            && interval.is_aligned(item.open_time_ms())
            && item.bar.is_valid()
    });
    let dropped = before - bars.len();
    if dropped > 0 {
        debug!(
            component = "merge",
            event = "dsm.merge.rows_dropped",
            dropped,
            "dropped rows outside the window, off-boundary, or with invalid values"
        );
    }

    // Stable sort on (open_time, priority) leaves the winning row first.
    bars.sort_by_key(|item| (item.open_time_ms(), item.source));
    let sorted_len = bars.len();
    bars.dedup_by_key(|item| item.open_time_ms());
    let duplicate_points_removed = (sorted_len - bars.len()) as u64;

    let expected_points = interval.expected_count(requested.start_ms, requested.end_ms);
    let actual_points = bars.len() as u64;

    let mut gaps = Vec::new();
    let mut cursor = interval.ceiling(requested.start_ms);
    for item in &bars {
        if item.open_time_ms() > cursor {
            gaps.push(TimeRange::new(cursor, item.open_time_ms()));
        }
        cursor = interval.next_boundary(item.open_time_ms());
    }
    if cursor < requested.end_ms {
        gaps.push(TimeRange::new(cursor, requested.end_ms));
    }

    let mut coverage = CoverageReport {
        expected_points,
        actual_points,
        duplicate_points_removed,
        total_gap_ranges: gaps.len() as u64,
        ..CoverageReport::default()
    };
    let mut inconsistencies = Vec::new();

    for gap in &gaps {
        let missing_bars = interval.expected_count(gap.start_ms, gap.end_ms);
        coverage.missing_points += missing_bars;
        if coverage.gap_ranges.len() < MAX_REPORTED_GAP_RANGES {
            coverage
                .gap_ranges
                .push((gap.start_ms, interval.floor(gap.end_ms - 1)));
        }

        if tolerate_boundary_ticks && is_boundary_tick(interval, gap, missing_bars) {
            coverage.boundary_tick_gaps += 1;
            debug!(
                component = "merge",
                event = "dsm.merge.boundary_tick_gap",
                open_time_ms = gap.start_ms,
                interval = interval.as_str()
            );
            continue;
        }

        if inconsistencies.len() < MAX_REPORTED_GAP_RANGES {
            inconsistencies.push(MergeInconsistency {
                range: *gap,
                missing_bars,
            });
        }
    }

    if !inconsistencies.is_empty() {
        warn!(
            component = "merge",
            event = "dsm.merge.gap_detected",
            interval = interval.as_str(),
            requested = %requested,
            gap_ranges = coverage.total_gap_ranges,
            missing_points = coverage.missing_points,
            first_gap = %inconsistencies[0].range
        );
    }

    MergeOutput {
        bars,
        coverage,
        inconsistencies,
    }
}

fn is_boundary_tick(interval: Interval, gap: &TimeRange, missing_bars: u64) -> bool {
    missing_bars == 1 && interval.nominal_ms() < DAY_MS && day_floor(gap.start_ms) == gap.start_ms
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompleteDay {
    pub day: NaiveDate,
    pub bars: Vec<Bar>,
    pub completeness: Completeness,
}

/// Closed UTC days inside `fetched` that hold a persistable set of bars.
///
/// `bars` must be sorted and unique by open time. A day short of its full
/// count only qualifies as a listing day when the fetch began earlier and
/// found nothing before it.
pub fn complete_days(
    fetched: TimeRange,
    interval: Interval,
    bars: &[SourcedBar],
    now_ms: i64,
) -> Vec<CompleteDay> {
    if !interval.fits_calendar_day() {
        return Vec::new();
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut earlier_bars = false;

    for day in days_in(fetched) {
        let range = day_range(day);
        let day_bars: Vec<Bar> = bars
            .iter()
            .filter(|item| range.contains(item.open_time_ms()))
            .filter(|item| seen.insert(item.open_time_ms()))
            .map(|item| item.bar)
            .collect();
        let has_bars = !day_bars.is_empty();

        if fetched.covers(&range) && range.end_ms <= now_ms && has_bars {
            let expected = interval.expected_count(range.start_ms, range.end_ms);
            let found = day_bars.len() as u64;
            if found == expected {
                out.push(CompleteDay {
                    day,
                    bars: day_bars,
                    completeness: Completeness::Full,
                });
            } else if !earlier_bars && fetched.start_ms < range.start_ms {
                let first = day_bars[0].open_time_ms;
                if first > range.start_ms && interval.expected_count(first, range.end_ms) == found {
                    out.push(CompleteDay {
                        day,
                        bars: day_bars,
                        completeness: Completeness::ListingDay,
                    });
                }
            }
        }

        earlier_bars |= has_bars;
    }

    out
}
