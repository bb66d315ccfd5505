//! DSM core crate: failover retrieval of OHLCV bars.
//!
//! Requests are served cache-first from per-day Arrow files, with missing
//! spans fetched from the bulk historical archive or the live REST API and
//! merged into one gap-annotated series.

mod cache_store;
mod config;
mod coordinator;
mod deadline;
mod http;
mod interval;
mod manager;
mod merge;
mod model;
mod observability;
mod planner;
mod rest;
mod retry;
mod sources;
mod vision;

pub use cache_store::{CacheIntegrityError, CacheKey, CacheStore, CacheWriteError, Completeness};
pub use config::{ConfigError, FcpConfig, HttpSourceConfig, DEFAULT_FRESHNESS_DELAY};
pub use coordinator::{
    chunk_ranges, FetchCoordinator, FetchError, FetchKey, SubRangeError, SubRangeFetch,
};
pub use deadline::{Cleanup, DeadlineScope, ScopeEvent};
pub use http::{HttpFetcher, HttpResponse, ReqwestFetcher};
pub use interval::{
    adjust_request_window, day_range, day_start_ms, days_in, utc_day, Interval, DAY_MS, HOUR_MS,
    MINUTE_MS, SECOND_MS,
};
pub use manager::{BarRequest, BarSeries, DataSourceManager, FcpError, FetchStats, GetDataOptions};
pub use merge::{
    complete_days, merge_sourced, CompleteDay, CoverageReport, MergeInconsistency, MergeOutput,
    MAX_REPORTED_GAP_RANGES,
};
pub use model::{Bar, MarketType, Provider, SourceTag, SourcedBar, TimeRange};
pub use observability::{
    init_logging, log_app_start, log_request_start, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use planner::{
    freshness_boundary, plan_enforced, plan_fetch, prepare_window, FetchPlan, PlannedFetch,
    PlanningError,
};
pub use rest::RestClient;
pub use retry::{RateGate, RetryConfig, RetryDecision, RetryState};
pub use sources::{BarSource, SourceError, SourceErrorKind, SourceRequest};
pub use vision::VisionClient;
