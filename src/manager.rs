//! Failover orchestration: plan, fetch missing ranges, merge, persist.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache_store::{CacheKey, CacheStore};
use crate::config::{FcpConfig, HttpSourceConfig};
use crate::coordinator::{FetchCoordinator, FetchError, FetchKey, SubRangeFetch};
use crate::deadline::{DeadlineScope, ScopeEvent};
use crate::interval::{days_in, Interval};
use crate::merge::{complete_days, merge_sourced, CoverageReport, MergeInconsistency};
use crate::model::{Bar, MarketType, SourceTag, SourcedBar, TimeRange};
use crate::planner::{plan_enforced, plan_fetch, prepare_window, FetchPlan, PlanningError};
use crate::rest::RestClient;
use crate::sources::{BarSource, SourceError};
use crate::vision::VisionClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarRequest {
    pub market: MarketType,
    pub symbol: String,
    pub interval: Interval,
    pub start_ts_ms_utc: i64,
    pub end_ts_ms_utc_exclusive: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetDataOptions {
    /// Pin one source and skip failover and caching.
    pub enforce_source: Option<SourceTag>,
    pub include_source: bool,
    pub freshness_delay: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchStats {
    pub cache_days: usize,
    pub planned_fetches: usize,
    pub fallbacks: usize,
    pub persisted_days: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BarSeries {
    pub symbol: String,
    pub market: MarketType,
    pub interval: Interval,
    /// Aligned window actually served.
    pub range: TimeRange,
    pub bars: Vec<Bar>,
    /// Parallel to `bars`; present only when requested.
    pub sources: Option<Vec<SourceTag>>,
    pub coverage: CoverageReport,
    pub warnings: Vec<MergeInconsistency>,
    pub stats: FetchStats,
}

#[derive(Debug, Error)]
pub enum FcpError {
    #[error(transparent)]
    Planning(#[from] PlanningError),
    #[error("{failed_source} source failed for {range}: {error}")]
    Source {
        range: TimeRange,
        failed_source: SourceTag,
        error: SourceError,
    },
    #[error("request deadline of {}ms exceeded ({forced_releases} fetches force-released)", .deadline.as_millis())]
    DeadlineExceeded {
        deadline: Duration,
        forced_releases: usize,
    },
    #[error("request cancelled ({forced_releases} fetches force-released)")]
    Cancelled { forced_releases: usize },
    #[error("fetch task failed: {0}")]
    Task(String),
}

enum Interrupt {
    Deadline,
    Cancelled,
    Failed(FcpError),
}

type PendingWrite = JoinHandle<usize>;

pub struct DataSourceManager {
    config: FcpConfig,
    cache: Arc<CacheStore>,
    coordinator: Arc<FetchCoordinator>,
    clock: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl DataSourceManager {
    pub fn new(config: FcpConfig, bulk: Arc<dyn BarSource>, live: Arc<dyn BarSource>) -> Self {
        let cache = Arc::new(CacheStore::from_config(&config));
        let coordinator = Arc::new(FetchCoordinator::new(
            bulk,
            live,
            config.max_workers,
            config.retry.clone(),
        ));
        Self {
            config,
            cache,
            coordinator,
            clock: Arc::new(|| Utc::now().timestamp_millis()),
        }
    }

    /// Manager wired to Binance Vision (bulk) and the Binance REST API (live).
    pub fn binance(config: FcpConfig, http: &HttpSourceConfig) -> Result<Self, SourceError> {
        let bulk = Arc::new(VisionClient::new(http)?);
        let live = Arc::new(RestClient::new(http)?);
        Ok(Self::new(config, bulk, live))
    }

    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &FcpConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub async fn get_data(
        &self,
        req: &BarRequest,
        opts: &GetDataOptions,
    ) -> Result<BarSeries, FcpError> {
        self.get_data_with_cancel(req, opts, CancellationToken::new())
            .await
    }

    pub async fn get_data_with_cancel(
        &self,
        req: &BarRequest,
        opts: &GetDataOptions,
        cancel: CancellationToken,
    ) -> Result<BarSeries, FcpError> {
        let started = Instant::now();
        let deadline = started + self.config.request_deadline;
        let now_ms = (self.clock)();
        let symbol = req.symbol.trim().to_ascii_uppercase();
        let range = prepare_window(
            &symbol,
            req.market,
            req.interval,
            req.start_ts_ms_utc,
            req.end_ts_ms_utc_exclusive,
            now_ms,
        )?;
        let freshness_delay = opts.freshness_delay.unwrap_or(self.config.freshness_delay);

        info!(
            component = "manager",
            event = "dsm.request.start",
            symbol = %symbol,
            market = req.market.as_str(),
            interval = req.interval.as_str(),
            range = %range,
            enforce_source = ?opts.enforce_source
        );

        let read_cache = self.config.cache_enabled
            && req.interval.fits_calendar_day()
            && matches!(opts.enforce_source, None | Some(SourceTag::Cache));
        let persist = self.config.cache_enabled
            && req.interval.fits_calendar_day()
            && opts.enforce_source.is_none();

        let cached = if read_cache {
            self.read_cached_days(&symbol, req, range, deadline, &cancel)
                .await?
        } else {
            BTreeMap::new()
        };
        let cached_set: BTreeSet<NaiveDate> = cached.keys().copied().collect();

        let bulk_supported = self.coordinator.bulk_supports(req.market, req.interval);
        let plan = match opts.enforce_source {
            None => plan_fetch(
                range,
                req.interval,
                &cached_set,
                bulk_supported,
                now_ms,
                freshness_delay,
            ),
            Some(tag) => plan_enforced(
                range,
                req.market,
                req.interval,
                tag,
                &cached_set,
                bulk_supported,
                now_ms,
                freshness_delay,
            )?,
        };

        let mut stats = FetchStats {
            cache_days: cached.len(),
            planned_fetches: plan.fetches.len(),
            ..FetchStats::default()
        };

        let outcome = self
            .run_fetches(
                &symbol,
                req,
                &plan,
                opts,
                persist,
                &cached_set,
                now_ms,
                deadline,
                &cancel,
            )
            .await;
        let (fetched, writes) = match outcome {
            Ok(done) => done,
            Err(err) => {
                warn!(
                    component = "manager",
                    event = "dsm.request.failed",
                    symbol = %symbol,
                    interval = req.interval.as_str(),
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64
                );
                return Err(err);
            }
        };

        // Writes are not part of the answer; wait only within the cleanup budget.
        let write_deadline = deadline + self.config.grace_period;
        for write in writes {
            match timeout_at(write_deadline, write).await {
                Ok(Ok(persisted)) => stats.persisted_days += persisted,
                Ok(Err(err)) => warn!(
                    component = "manager",
                    event = "dsm.cache.write_task_failed",
                    error = %err
                ),
                Err(_) => break,
            }
        }

        let mut all: Vec<SourcedBar> = cached
            .into_values()
            .flatten()
            .map(|bar| SourcedBar::new(bar, SourceTag::Cache))
            .collect();
        for sub in &fetched {
            stats.fallbacks += usize::from(sub.fell_back);
            all.extend(sub.bars.iter().copied());
        }

        let merged = merge_sourced(
            range,
            req.interval,
            all,
            self.config.tolerate_boundary_tick_gaps,
        );
        let (bars, tags): (Vec<Bar>, Vec<SourceTag>) = merged
            .bars
            .iter()
            .map(|item| (item.bar, item.source))
            .unzip();

        info!(
            component = "manager",
            event = "dsm.request.done",
            symbol = %symbol,
            interval = req.interval.as_str(),
            rows = bars.len(),
            expected = merged.coverage.expected_points,
            missing = merged.coverage.missing_points,
            cache_days = stats.cache_days,
            fetches = stats.planned_fetches,
            fallbacks = stats.fallbacks,
            persisted_days = stats.persisted_days,
            elapsed_ms = started.elapsed().as_millis() as u64
        );

        Ok(BarSeries {
            symbol,
            market: req.market,
            interval: req.interval,
            range,
            bars,
            sources: opts.include_source.then_some(tags),
            coverage: merged.coverage,
            warnings: merged.inconsistencies,
            stats,
        })
    }

    async fn read_cached_days(
        &self,
        symbol: &str,
        req: &BarRequest,
        range: TimeRange,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<NaiveDate, Vec<Bar>>, FcpError> {
        let cache = Arc::clone(&self.cache);
        let provider = self.config.provider;
        let symbol = symbol.to_string();
        let market = req.market;
        let interval = req.interval;

        let read = tokio::task::spawn_blocking(move || {
            days_in(range)
                .into_iter()
                .filter_map(|day| {
                    let key = CacheKey {
                        provider,
                        market,
                        symbol: symbol.clone(),
                        interval,
                        day,
                    };
                    cache.read(&key).map(|bars| (day, bars))
                })
                .collect::<BTreeMap<_, _>>()
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FcpError::Cancelled { forced_releases: 0 }),
            result = timeout_at(deadline, read) => match result {
                Ok(Ok(days)) => Ok(days),
                Ok(Err(err)) => Err(FcpError::Task(err.to_string())),
                Err(_) => Err(FcpError::DeadlineExceeded {
                    deadline: self.config.request_deadline,
                    forced_releases: 0,
                }),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_fetches(
        &self,
        symbol: &str,
        req: &BarRequest,
        plan: &FetchPlan,
        opts: &GetDataOptions,
        persist: bool,
        cached: &BTreeSet<NaiveDate>,
        now_ms: i64,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Arc<SubRangeFetch>>, Vec<PendingWrite>), FcpError> {
        let mut fetched = Vec::new();
        let mut writes = Vec::new();
        if plan.fetches.is_empty() {
            return Ok((fetched, writes));
        }

        let mut scope = DeadlineScope::new(cancel, deadline, self.config.grace_period);
        for planned in &plan.fetches {
            let key = FetchKey {
                provider: self.config.provider,
                market: req.market,
                symbol: symbol.to_string(),
                interval: req.interval,
                range: planned.range,
                planned: planned.source,
                allow_fallback: opts.enforce_source.is_none(),
            };
            let coordinator = Arc::clone(&self.coordinator);
            scope.spawn(move |token| async move { coordinator.fetch(&key, &token).await });
        }

        let mut interrupt = None;
        loop {
            match scope.next().await {
                ScopeEvent::Completed(Ok(sub)) => {
                    if persist {
                        writes.push(self.persist_days(symbol, req, &sub, cached, now_ms));
                    }
                    fetched.push(sub);
                }
                ScopeEvent::Completed(Err(FetchError::Source(err))) => {
                    interrupt = Some(Interrupt::Failed(FcpError::Source {
                        range: err.range,
                        failed_source: err.failed_source,
                        error: err.error,
                    }));
                    break;
                }
                ScopeEvent::Completed(Err(FetchError::Cancelled)) | ScopeEvent::Cancelled => {
                    interrupt = Some(Interrupt::Cancelled);
                    break;
                }
                ScopeEvent::TaskFailed(message) => {
                    interrupt = Some(Interrupt::Failed(FcpError::Task(message)));
                    break;
                }
                ScopeEvent::DeadlineExpired => {
                    interrupt = Some(Interrupt::Deadline);
                    break;
                }
                ScopeEvent::Exhausted => break,
            }
        }

        let cleanup = scope.shutdown().await;
        // Sub-ranges that finished while unwinding still get persisted.
        if persist {
            for sub in cleanup.settled.into_iter().flatten() {
                writes.push(self.persist_days(symbol, req, &sub, cached, now_ms));
            }
        }

        match interrupt {
            None => Ok((fetched, writes)),
            Some(Interrupt::Failed(err)) => Err(err),
            Some(Interrupt::Cancelled) => Err(FcpError::Cancelled {
                forced_releases: cleanup.forced,
            }),
            Some(Interrupt::Deadline) => Err(FcpError::DeadlineExceeded {
                deadline: self.config.request_deadline,
                forced_releases: cleanup.forced,
            }),
        }
    }

    /// Writes each complete, closed day of `sub` not already cached.
    fn persist_days(
        &self,
        symbol: &str,
        req: &BarRequest,
        sub: &SubRangeFetch,
        cached: &BTreeSet<NaiveDate>,
        now_ms: i64,
    ) -> PendingWrite {
        let days: Vec<_> = complete_days(sub.range, req.interval, &sub.bars, now_ms)
            .into_iter()
            .filter(|day| !cached.contains(&day.day))
            .collect();
        let cache = Arc::clone(&self.cache);
        let provider = self.config.provider;
        let symbol = symbol.to_string();
        let market = req.market;
        let interval = req.interval;

        tokio::task::spawn_blocking(move || {
            let mut written = 0;
            for day in days {
                let key = CacheKey {
                    provider,
                    market,
                    symbol: symbol.clone(),
                    interval,
                    day: day.day,
                };
                match cache.write(&key, &day.bars, day.completeness, now_ms) {
                    Ok(_) => written += 1,
                    Err(err) => warn!(
                        component = "manager",
                        event = "dsm.cache.write_failed",
                        symbol = %symbol,
                        interval = interval.as_str(),
                        day = %day.day,
                        error = %err
                    ),
                }
            }
            debug!(
                component = "manager",
                event = "dsm.cache.persisted",
                symbol = %symbol,
                interval = interval.as_str(),
                days = written
            );
            written
        })
    }
}
