//! Live source backed by the Binance klines REST endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use tracing::debug;

use crate::config::HttpSourceConfig;
use crate::http::{status_error, HttpFetcher, ReqwestFetcher};
use crate::interval::Interval;
use crate::model::{Bar, MarketType, SourceTag};
use crate::sources::{BarSource, SourceError, SourceRequest};

const SPOT_LIMIT: u64 = 1_000;
const FUTURES_LIMIT: u64 = 1_500;

pub struct RestClient {
    fetcher: Arc<dyn HttpFetcher>,
    spot_url: String,
    futures_usdt_url: String,
    futures_coin_url: String,
}

impl RestClient {
    pub fn new(cfg: &HttpSourceConfig) -> Result<Self, SourceError> {
        let fetcher = ReqwestFetcher::new(cfg.timeout)?;
        Ok(Self::with_fetcher(Arc::new(fetcher), cfg))
    }

    pub fn with_fetcher(fetcher: Arc<dyn HttpFetcher>, cfg: &HttpSourceConfig) -> Self {
        Self {
            fetcher,
            spot_url: cfg.spot_rest_url.clone(),
            futures_usdt_url: cfg.futures_usdt_rest_url.clone(),
            futures_coin_url: cfg.futures_coin_rest_url.clone(),
        }
    }

    fn endpoint(&self, market: MarketType) -> &str {
        match market {
            MarketType::Spot => &self.spot_url,
            MarketType::FuturesUsdt => &self.futures_usdt_url,
            MarketType::FuturesCoin => &self.futures_coin_url,
        }
    }

    fn page_url(
        &self,
        req: &SourceRequest,
        cursor: i64,
        limit: u64,
    ) -> Result<String, SourceError> {
        // endTime is inclusive upstream.
        let params = [
            ("symbol", req.symbol.to_ascii_uppercase()),
            ("interval", req.interval.as_str().to_string()),
            ("startTime", cursor.to_string()),
            ("endTime", (req.range.end_ms - 1).to_string()),
            ("limit", limit.to_string()),
        ];
        Url::parse_with_params(self.endpoint(req.market), &params)
            .map(String::from)
            .map_err(|err| SourceError::permanent(format!("invalid klines url: {err}")))
    }
}

#[async_trait]
impl BarSource for RestClient {
    fn tag(&self) -> SourceTag {
        SourceTag::Live
    }

    fn supports(&self, market: MarketType, interval: Interval) -> bool {
        market.supports_interval(interval)
    }

    fn max_rows_per_call(&self, market: MarketType, _interval: Interval) -> u64 {
        match market {
            MarketType::Spot => SPOT_LIMIT,
            MarketType::FuturesUsdt | MarketType::FuturesCoin => FUTURES_LIMIT,
        }
    }

    async fn fetch(&self, req: &SourceRequest) -> Result<Vec<Bar>, SourceError> {
        let limit = self.max_rows_per_call(req.market, req.interval);
        let requested = req.interval.expected_count(req.range.start_ms, req.range.end_ms);
        if requested > limit {
            return Err(SourceError::permanent(format!(
                "{requested} rows requested, limit is {limit}"
            )));
        }
        if !self.supports(req.market, req.interval) {
            return Err(SourceError::permanent(format!(
                "{} klines are not offered for {}",
                req.interval, req.market
            )));
        }

        let mut bars = Vec::new();
        let mut cursor = req.range.start_ms;
        while cursor < req.range.end_ms {
            let url = self.page_url(req, cursor, limit)?;
            let response = self.fetcher.get(&url).await?;
            if !response.is_success() {
                return Err(status_error(&url, &response));
            }

            let payload: Value = serde_json::from_slice(&response.body).map_err(|err| {
                SourceError::transient(format!("GET {url}: malformed payload: {err}"))
            })?;
            let rows = payload.as_array().ok_or_else(|| {
                SourceError::transient(format!("GET {url}: expected top-level array"))
            })?;
            if rows.is_empty() {
                break;
            }

            let mut last_open = cursor;
            for row in rows {
                let bar = parse_rest_kline_row(row)
                    .map_err(|detail| SourceError::transient(format!("GET {url}: {detail}")))?;
                last_open = last_open.max(bar.open_time_ms);
                if req.range.contains(bar.open_time_ms) {
                    bars.push(bar);
                }
            }

            let next_cursor = req.interval.next_boundary(last_open);
            if next_cursor <= cursor {
                break;
            }
            cursor = next_cursor;
        }

        debug!(
            component = "rest",
            event = "dsm.rest.klines_loaded",
            symbol = %req.symbol,
            interval = req.interval.as_str(),
            range = %req.range,
            rows = bars.len()
        );
        Ok(bars)
    }
}

fn parse_rest_kline_row(value: &Value) -> Result<Bar, String> {
    let row = value
        .as_array()
        .ok_or_else(|| "unexpected kline row: expected array".to_string())?;
    if row.len() < 6 {
        return Err(format!("unexpected kline row length: {}", row.len()));
    }

    Ok(Bar {
        open_time_ms: json_i64(&row[0])?,
        open: json_f64(&row[1])?,
        high: json_f64(&row[2])?,
        low: json_f64(&row[3])?,
        close: json_f64(&row[4])?,
        volume: json_f64(&row[5])?,
    })
}

fn json_i64(value: &Value) -> Result<i64, String> {
    if let Some(v) = value.as_i64() {
        return Ok(v);
    }
    value
        .as_str()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| format!("expected i64-compatible value, got {value}"))
}

fn json_f64(value: &Value) -> Result<f64, String> {
    // Prices arrive as decimal strings.
    if let Some(v) = value.as_f64() {
        return Ok(v);
    }
    value
        .as_str()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| format!("expected f64-compatible value, got {value}"))
}
