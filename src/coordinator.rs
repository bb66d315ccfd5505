//! Bounded, deduplicated dispatch of planned fetches to the remote sources.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::{OnceCell, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::interval::{day_ceiling, Interval, DAY_MS};
use crate::model::{Bar, MarketType, Provider, SourceTag, SourcedBar, TimeRange};
use crate::retry::{RateGate, RetryConfig, RetryDecision, RetryState};
use crate::sources::{BarSource, SourceError, SourceErrorKind, SourceRequest};

/// One planned sub-range of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchKey {
    pub provider: Provider,
    pub market: MarketType,
    pub symbol: String,
    pub interval: Interval,
    pub range: TimeRange,
    pub planned: SourceTag,
    pub allow_fallback: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubRangeFetch {
    pub range: TimeRange,
    pub planned: SourceTag,
    /// Sorted by open time; tagged with the source that actually produced them.
    pub bars: Vec<SourcedBar>,
    pub fell_back: bool,
    pub chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{failed_source} fetch failed for {range}: {error}")]
pub struct SubRangeError {
    pub range: TimeRange,
    pub failed_source: SourceTag,
    pub error: SourceError,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error(transparent)]
    Source(#[from] SubRangeError),
    #[error("fetch cancelled")]
    Cancelled,
}

/// Identity of one upstream call. Chunks sit on the UTC day grid, so for
/// day-sized intervals a bulk chunk is exactly one cache day.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChunkKey {
    provider: Provider,
    market: MarketType,
    symbol: String,
    interval: Interval,
    source: SourceTag,
    range: TimeRange,
}

type ChunkOutcome = Result<Arc<Vec<Bar>>, SourceError>;
type ChunkCell = OnceCell<ChunkOutcome>;
type InflightMap = HashMap<ChunkKey, Arc<ChunkCell>>;

enum ChunkFailure {
    Source(SourceError),
    Cancelled,
}

/// A caller's interest in one chunk. Whoever reaches the cell first runs the
/// upstream call; everyone else holding a claim receives the same outcome.
struct ChunkClaim<'a> {
    owner: &'a FetchCoordinator,
    key: ChunkKey,
    // Taken only by `drop`.
    cell: Option<Arc<ChunkCell>>,
}

impl Drop for ChunkClaim<'_> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            self.owner.release(&self.key, cell);
        }
    }
}

pub struct FetchCoordinator {
    bulk: Arc<dyn BarSource>,
    live: Arc<dyn BarSource>,
    workers: Arc<Semaphore>,
    retry: RetryConfig,
    bulk_gate: RateGate,
    live_gate: RateGate,
    inflight: Mutex<InflightMap>,
}

impl FetchCoordinator {
    pub fn new(
        bulk: Arc<dyn BarSource>,
        live: Arc<dyn BarSource>,
        max_workers: usize,
        retry: RetryConfig,
    ) -> Self {
        Self {
            bulk,
            live,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
            retry,
            bulk_gate: RateGate::new(),
            live_gate: RateGate::new(),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn bulk_supports(&self, market: MarketType, interval: Interval) -> bool {
        self.bulk.supports(market, interval)
    }

    pub fn live_supports(&self, market: MarketType, interval: Interval) -> bool {
        self.live.supports(market, interval)
    }

    /// Number of chunks currently claimed by at least one caller.
    pub fn inflight_len(&self) -> usize {
        self.lock_inflight().len()
    }

    /// Fetches one planned sub-range, chunk by chunk.
    ///
    /// Every chunk is claimed before the first call goes out, so a concurrent
    /// request covering the same chunk joins it instead of calling upstream
    /// again. Source failures are shared with joined callers; cancellation is
    /// not, so a surviving caller restarts the chunk under its own token.
    pub async fn fetch(
        &self,
        key: &FetchKey,
        cancel: &CancellationToken,
    ) -> Result<Arc<SubRangeFetch>, FetchError> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            permit = Arc::clone(&self.workers).acquire_owned() => {
                permit.map_err(|_| FetchError::Cancelled)?
            }
        };

        let Some((primary, gate)) = self.source_for(key.planned) else {
            return Err(FetchError::Source(SubRangeError {
                range: key.range,
                failed_source: key.planned,
                error: SourceError::permanent("cache is not a remote source"),
            }));
        };

        let started = Instant::now();
        let max_rows = primary.max_rows_per_call(key.market, key.interval);
        let claims = self.claim_all(key, key.planned, key.range, max_rows);
        let mut bars = Vec::new();
        let mut fell_back = false;
        let mut chunk_count = 0;

        for claim in &claims {
            chunk_count += 1;
            match self.run_claim(primary, gate, key, claim, cancel).await {
                Ok(rows) => bars.extend(rows.iter().map(|bar| SourcedBar::new(*bar, key.planned))),
                Err(ChunkFailure::Cancelled) => return Err(FetchError::Cancelled),
                Err(ChunkFailure::Source(error)) => {
                    let remainder = TimeRange::new(claim.key.range.start_ms, key.range.end_ms);
                    if key.planned != SourceTag::BulkHistorical || !key.allow_fallback {
                        return Err(FetchError::Source(SubRangeError {
                            range: remainder,
                            failed_source: key.planned,
                            error,
                        }));
                    }

                    warn!(
                        component = "coordinator",
                        event = "dsm.fetch.fallback",
                        symbol = %key.symbol,
                        interval = key.interval.as_str(),
                        range = %remainder,
                        error_kind = error.kind.as_str(),
                        error = %error.message,
                        "bulk source failed; refetching remainder from live"
                    );
                    let live_max = self.live.max_rows_per_call(key.market, key.interval);
                    let live_claims = self.claim_all(key, SourceTag::Live, remainder, live_max);
                    for live_claim in &live_claims {
                        chunk_count += 1;
                        match self
                            .run_claim(&self.live, &self.live_gate, key, live_claim, cancel)
                            .await
                        {
                            Ok(rows) => bars.extend(
                                rows.iter().map(|bar| SourcedBar::new(*bar, SourceTag::Live)),
                            ),
                            Err(ChunkFailure::Cancelled) => return Err(FetchError::Cancelled),
                            Err(ChunkFailure::Source(error)) => {
                                return Err(FetchError::Source(SubRangeError {
                                    range: TimeRange::new(
                                        live_claim.key.range.start_ms,
                                        key.range.end_ms,
                                    ),
                                    failed_source: SourceTag::Live,
                                    error,
                                }));
                            }
                        }
                    }
                    fell_back = true;
                    break;
                }
            }
        }

        bars.sort_by_key(|item| (item.open_time_ms(), item.source));
        info!(
            component = "coordinator",
            event = "dsm.fetch.subrange_done",
            symbol = %key.symbol,
            interval = key.interval.as_str(),
            range = %key.range,
            planned = key.planned.as_str(),
            rows = bars.len(),
            chunks = chunk_count,
            fell_back,
            elapsed_ms = started.elapsed().as_millis() as u64
        );

        Ok(Arc::new(SubRangeFetch {
            range: key.range,
            planned: key.planned,
            bars,
            fell_back,
            chunks: chunk_count,
        }))
    }

    fn claim_all(
        &self,
        key: &FetchKey,
        source: SourceTag,
        range: TimeRange,
        max_rows: u64,
    ) -> Vec<ChunkClaim<'_>> {
        let mut inflight = self.lock_inflight();
        chunk_ranges(range, key.interval, max_rows)
            .into_iter()
            .map(|chunk| {
                let chunk_key = ChunkKey {
                    provider: key.provider,
                    market: key.market,
                    symbol: key.symbol.clone(),
                    interval: key.interval,
                    source,
                    range: chunk,
                };
                let cell = match inflight.get(&chunk_key) {
                    Some(existing) => {
                        debug!(
                            component = "coordinator",
                            event = "dsm.fetch.dedupe_joined",
                            symbol = %key.symbol,
                            range = %chunk,
                            source_tag = source.as_str()
                        );
                        Arc::clone(existing)
                    }
                    None => {
                        let cell = Arc::new(OnceCell::new());
                        inflight.insert(chunk_key.clone(), Arc::clone(&cell));
                        cell
                    }
                };
                ChunkClaim {
                    owner: self,
                    key: chunk_key,
                    cell: Some(cell),
                }
            })
            .collect()
    }

    /// Drops a claim's handle and forgets the chunk once it has an outcome or
    /// nobody else holds it.
    fn release(&self, key: &ChunkKey, cell: Arc<ChunkCell>) {
        let mut inflight = self.lock_inflight();
        let registered = inflight
            .get(key)
            .is_some_and(|existing| Arc::ptr_eq(existing, &cell));
        let finished = cell.initialized();
        // Handles are cloned and dropped only under this lock, so after our
        // own drop a count of one means the map is the sole holder.
        drop(cell);
        if !registered {
            return;
        }
        let abandoned = inflight
            .get(key)
            .is_some_and(|existing| Arc::strong_count(existing) == 1);
        if finished || abandoned {
            inflight.remove(key);
        }
    }

    async fn run_claim(
        &self,
        source: &Arc<dyn BarSource>,
        gate: &RateGate,
        key: &FetchKey,
        claim: &ChunkClaim<'_>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Vec<Bar>>, ChunkFailure> {
        let Some(cell) = claim.cell.as_ref() else {
            return Err(ChunkFailure::Cancelled);
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChunkFailure::Cancelled),
            result = cell.get_or_try_init(|| async {
                match self.fetch_chunk(source, gate, key, claim.key.range, cancel).await {
                    Ok(rows) => Ok(Ok(Arc::new(rows))),
                    Err(ChunkFailure::Source(err)) => Ok(Err(err)),
                    Err(ChunkFailure::Cancelled) => Err(ChunkFailure::Cancelled),
                }
            }) => result?.clone(),
        };
        outcome.map_err(ChunkFailure::Source)
    }

    async fn fetch_chunk(
        &self,
        source: &Arc<dyn BarSource>,
        gate: &RateGate,
        key: &FetchKey,
        chunk: TimeRange,
        cancel: &CancellationToken,
    ) -> Result<Vec<Bar>, ChunkFailure> {
        let req = SourceRequest {
            market: key.market,
            symbol: key.symbol.clone(),
            interval: key.interval,
            range: chunk,
        };
        let mut state = RetryState::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChunkFailure::Cancelled),
                _ = gate.wait() => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChunkFailure::Cancelled),
                result = source.fetch(&req) => result,
            };

            let err = match result {
                Ok(rows) => return Ok(rows),
                Err(err) => err,
            };

            match state.record_failure(&err.kind, &self.retry) {
                RetryDecision::GiveUp => {
                    warn!(
                        component = "coordinator",
                        event = "dsm.fetch.chunk_failed",
                        source_tag = source.tag().as_str(),
                        symbol = %key.symbol,
                        range = %chunk,
                        attempts = state.attempts(),
                        error = %err
                    );
                    return Err(ChunkFailure::Source(err));
                }
                RetryDecision::RetryAfter(delay) => {
                    if matches!(err.kind, SourceErrorKind::RateLimited { .. }) {
                        gate.pause_until(Instant::now() + delay);
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ChunkFailure::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn source_for(&self, tag: SourceTag) -> Option<(&Arc<dyn BarSource>, &RateGate)> {
        match tag {
            SourceTag::BulkHistorical => Some((&self.bulk, &self.bulk_gate)),
            SourceTag::Live => Some((&self.live, &self.live_gate)),
            SourceTag::Cache => None,
        }
    }

    fn lock_inflight(&self) -> MutexGuard<'_, InflightMap> {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Splits an aligned range into pieces of at most `max_rows` bars.
///
/// For intervals that fit a calendar day the pieces never cross a UTC
/// midnight and are laid out from the day start, so overlapping requests
/// produce identical chunks for the days they share.
pub fn chunk_ranges(range: TimeRange, interval: Interval, max_rows: u64) -> Vec<TimeRange> {
    let mut out = Vec::new();
    let step = max_rows.max(1);
    let mut cursor = interval.floor(range.start_ms).max(range.start_ms);
    while cursor < range.end_ms {
        let next = if interval.fits_calendar_day() {
            let day_end = day_ceiling(cursor + 1);
            let day_start = day_end - DAY_MS;
            let rows_into_day = interval.expected_count(day_start, interval.floor(cursor));
            let grid = interval.advance(day_start, (rows_into_day / step + 1) * step);
            grid.min(day_end).min(range.end_ms)
        } else {
            interval.advance(interval.floor(cursor), step).min(range.end_ms)
        };
        if next <= cursor {
            break;
        }
        out.push(TimeRange::new(cursor, next));
        cursor = next;
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::interval::{HOUR_MS, MINUTE_MS};

    struct SlowSource {
        tag: SourceTag,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl SlowSource {
        fn new(tag: SourceTag, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                tag,
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(delay_ms),
            })
        }
    }

    #[async_trait]
    impl BarSource for SlowSource {
        fn tag(&self) -> SourceTag {
            self.tag
        }

        fn supports(&self, _market: MarketType, _interval: Interval) -> bool {
            true
        }

        fn max_rows_per_call(&self, _market: MarketType, interval: Interval) -> u64 {
            interval.bars_per_day().unwrap_or(1)
        }

        async fn fetch(&self, req: &SourceRequest) -> Result<Vec<Bar>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(req
                .interval
                .boundaries(req.range)
                .map(|open_time_ms| Bar {
                    open_time_ms,
                    open: 1.0,
                    high: 2.0,
                    low: 0.5,
                    close: 1.5,
                    volume: 3.0,
                })
                .collect())
        }
    }

    fn coordinator(bulk: Arc<SlowSource>) -> FetchCoordinator {
        FetchCoordinator::new(
            bulk,
            SlowSource::new(SourceTag::Live, 0),
            8,
            RetryConfig::default(),
        )
    }

    fn bulk_key(start_day: i64, end_day: i64) -> FetchKey {
        FetchKey {
            provider: Provider::Binance,
            market: MarketType::Spot,
            symbol: "BTCUSDT".to_string(),
            interval: Interval::Hour1,
            range: TimeRange::new(start_day * DAY_MS, end_day * DAY_MS),
            planned: SourceTag::BulkHistorical,
            allow_fallback: true,
        }
    }

    #[test]
    fn chunks_respect_row_limit_and_day_grid() {
        let range = TimeRange::new(0, 2_500 * MINUTE_MS);
        let chunks = chunk_ranges(range, Interval::Min1, 1_000);
        assert_eq!(
            chunks,
            vec![
                TimeRange::new(0, 1_000 * MINUTE_MS),
                TimeRange::new(1_000 * MINUTE_MS, 1_440 * MINUTE_MS),
                TimeRange::new(1_440 * MINUTE_MS, 2_440 * MINUTE_MS),
                TimeRange::new(2_440 * MINUTE_MS, 2_500 * MINUTE_MS),
            ]
        );
        for chunk in &chunks {
            assert!(Interval::Min1.expected_count(chunk.start_ms, chunk.end_ms) <= 1_000);
        }
    }

    #[test]
    fn mid_day_start_lands_on_the_same_grid() {
        let from_midnight = chunk_ranges(TimeRange::new(0, DAY_MS), Interval::Min1, 1_000);
        let from_noon = chunk_ranges(TimeRange::new(12 * HOUR_MS, DAY_MS), Interval::Min1, 1_000);
        assert_eq!(
            from_noon,
            vec![
                TimeRange::new(12 * HOUR_MS, 1_000 * MINUTE_MS),
                TimeRange::new(1_000 * MINUTE_MS, DAY_MS),
            ]
        );
        assert_eq!(from_midnight.last(), from_noon.last());
    }

    #[test]
    fn daily_chunks_for_one_day_per_call() {
        let range = TimeRange::new(0, 3 * DAY_MS);
        let chunks = chunk_ranges(range, Interval::Hour1, 24);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1], TimeRange::new(DAY_MS, 2 * DAY_MS));
        assert!(chunk_ranges(TimeRange::new(5, 5), Interval::Hour1, 24).is_empty());
    }

    #[test]
    fn longer_intervals_ignore_the_day_grid() {
        let range = TimeRange::new(0, 30 * DAY_MS);
        let chunks = chunk_ranges(range, Interval::Day3, 1_000);
        assert_eq!(chunks, vec![range]);
    }

    #[tokio::test]
    async fn overlapping_sub_ranges_share_their_common_days() {
        let bulk = SlowSource::new(SourceTag::BulkHistorical, 50);
        let coordinator = coordinator(Arc::clone(&bulk));
        let cancel = CancellationToken::new();

        let left_key = bulk_key(0, 3);
        let right_key = bulk_key(1, 4);
        let (left, right) = tokio::join!(
            coordinator.fetch(&left_key, &cancel),
            coordinator.fetch(&right_key, &cancel),
        );

        assert_eq!(left.map(|fetch| fetch.bars.len()).ok(), Some(72));
        assert_eq!(right.map(|fetch| fetch.bars.len()).ok(), Some(72));
        assert_eq!(bulk.calls.load(Ordering::SeqCst), 4);
        assert_eq!(coordinator.inflight_len(), 0);
    }

    #[tokio::test]
    async fn cancelled_joiners_leave_no_claims_behind() {
        let bulk = SlowSource::new(SourceTag::BulkHistorical, 200);
        let coordinator = coordinator(Arc::clone(&bulk));
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        let cancel_both = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            first.cancel();
            second.cancel();
        };
        let a_key = bulk_key(0, 2);
        let b_key = bulk_key(0, 2);
        let (a, b, ()) = tokio::join!(
            coordinator.fetch(&a_key, &first),
            coordinator.fetch(&b_key, &second),
            cancel_both,
        );

        assert_eq!(a, Err(FetchError::Cancelled));
        assert_eq!(b, Err(FetchError::Cancelled));
        assert_eq!(coordinator.inflight_len(), 0);
    }
}
