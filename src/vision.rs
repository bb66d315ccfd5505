//! Bulk historical source backed by Binance Vision daily kline archives.

use std::io::{Cursor, Read};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use csv::StringRecord;
use sha2::{Digest, Sha256};
use tracing::debug;
use zip::ZipArchive;

use crate::config::HttpSourceConfig;
use crate::http::{status_error, HttpFetcher, ReqwestFetcher};
use crate::interval::{day_range, utc_day, Interval};
use crate::model::{Bar, MarketType, SourceTag};
use crate::sources::{BarSource, SourceError, SourceErrorKind, SourceRequest};

pub struct VisionClient {
    fetcher: Arc<dyn HttpFetcher>,
    base_url: String,
    publish_lag_ms: i64,
    clock: fn() -> i64,
}

impl VisionClient {
    pub fn new(cfg: &HttpSourceConfig) -> Result<Self, SourceError> {
        let fetcher = ReqwestFetcher::new(cfg.timeout)?;
        Ok(Self::with_fetcher(Arc::new(fetcher), cfg))
    }

    pub fn with_fetcher(fetcher: Arc<dyn HttpFetcher>, cfg: &HttpSourceConfig) -> Self {
        Self {
            fetcher,
            base_url: cfg.vision_base_url.trim_end_matches('/').to_string(),
            publish_lag_ms: i64::try_from(cfg.vision_publish_lag.as_millis()).unwrap_or(i64::MAX),
            clock: || Utc::now().timestamp_millis(),
        }
    }

    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn archive_url(
        &self,
        market: MarketType,
        symbol: &str,
        interval: Interval,
        day: NaiveDate,
    ) -> String {
        let symbol = symbol.to_ascii_uppercase();
        let segment = match market {
            MarketType::Spot => "spot",
            MarketType::FuturesUsdt => "futures/um",
            MarketType::FuturesCoin => "futures/cm",
        };
        format!(
            "{}/{segment}/daily/klines/{symbol}/{interval}/{symbol}-{interval}-{}.zip",
            self.base_url,
            day.format("%Y-%m-%d")
        )
    }

    async fn get_checked(&self, url: &str, day: NaiveDate) -> Result<Vec<u8>, SourceError> {
        let response = self.fetcher.get(url).await?;
        if response.is_success() {
            return Ok(response.body);
        }
        if response.status == 404 {
            // Vision publishes each day with a lag; a recent 404 is not final.
            let published_by = day_range(day).end_ms.saturating_add(self.publish_lag_ms);
            let kind = if (self.clock)() < published_by {
                SourceErrorKind::NotYetAvailable
            } else {
                SourceErrorKind::NotFound
            };
            return Err(SourceError::new(kind, format!("GET {url}: HTTP 404")));
        }
        Err(status_error(url, &response))
    }
}

#[async_trait]
impl BarSource for VisionClient {
    fn tag(&self) -> SourceTag {
        SourceTag::BulkHistorical
    }

    fn supports(&self, market: MarketType, interval: Interval) -> bool {
        market.supports_interval(interval) && interval.fits_calendar_day()
    }

    fn max_rows_per_call(&self, _market: MarketType, interval: Interval) -> u64 {
        interval.bars_per_day().unwrap_or(1)
    }

    async fn fetch(&self, req: &SourceRequest) -> Result<Vec<Bar>, SourceError> {
        if !self.supports(req.market, req.interval) {
            return Err(SourceError::new(
                SourceErrorKind::NotFound,
                format!("no daily archives for {} {}", req.market, req.interval),
            ));
        }
        let day = utc_day(req.range.start_ms).ok_or_else(|| {
            SourceError::permanent(format!("invalid start {}", req.range.start_ms))
        })?;
        if !day_range(day).covers(&req.range) {
            return Err(SourceError::permanent(format!(
                "range {} spans more than one archive day",
                req.range
            )));
        }

        let url = self.archive_url(req.market, &req.symbol, req.interval, day);
        let checksum_url = format!("{url}.CHECKSUM");
        let payload = self.get_checked(&checksum_url, day).await?;
        let expected = parse_checksum_payload(&checksum_url, &payload)?;
        let archive = self.get_checked(&url, day).await?;

        let actual = hex::encode(Sha256::digest(&archive));
        if actual != expected {
            return Err(SourceError::new(
                SourceErrorKind::ChecksumMismatch,
                format!("{url}: expected {expected}, got {actual}"),
            ));
        }

        let rows = parse_zip_archive(&url, &archive)?;
        let bars: Vec<Bar> = rows
            .into_iter()
            .filter(|bar| req.range.contains(bar.open_time_ms))
            .collect();
        debug!(
            component = "vision",
            event = "dsm.vision.archive_loaded",
            url = %url,
            rows = bars.len()
        );
        Ok(bars)
    }
}

fn parse_checksum_payload(url: &str, payload: &[u8]) -> Result<String, SourceError> {
    let text = String::from_utf8_lossy(payload);
    let token = text.split_whitespace().next().unwrap_or_default();
    if token.len() != 64 || hex::decode(token).is_err() {
        return Err(SourceError::new(
            SourceErrorKind::ChecksumMismatch,
            format!("invalid checksum payload from {url}: '{}'", text.trim()),
        ));
    }
    Ok(token.to_ascii_lowercase())
}

fn parse_zip_archive(url: &str, bytes: &[u8]) -> Result<Vec<Bar>, SourceError> {
    let corrupt = |detail: String| SourceError::permanent(format!("{url}: {detail}"));
    let mut zip = ZipArchive::new(Cursor::new(bytes)).map_err(|err| corrupt(err.to_string()))?;

    let mut csv_buf = None;
    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx).map_err(|err| corrupt(err.to_string()))?;
        if entry.is_dir() || !entry.name().to_ascii_lowercase().ends_with(".csv") {
            continue;
        }
        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .map_err(|err| corrupt(err.to_string()))?;
        csv_buf = Some(buf);
        break;
    }
    let csv_buf = csv_buf.ok_or_else(|| corrupt("archive holds no csv entry".to_string()))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(Cursor::new(csv_buf));

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|err| corrupt(err.to_string()))?;
        // Newer futures archives start with a header row.
        if line == 0 && record.get(0).is_some_and(|first| first.parse::<i64>().is_err()) {
            continue;
        }
        let bar = parse_kline_record(&record)
            .map_err(|detail| corrupt(format!("line {}: {detail}", line + 1)))?;
        rows.push(bar);
    }
    Ok(rows)
}

fn parse_kline_record(record: &StringRecord) -> Result<Bar, String> {
    if record.len() < 6 {
        return Err(format!("expected at least 6 columns, found {}", record.len()));
    }
    Ok(Bar {
        open_time_ms: normalize_to_millis(parse_field::<i64>(record, 0, "open_time")?),
        open: parse_field(record, 1, "open")?,
        high: parse_field(record, 2, "high")?,
        low: parse_field(record, 3, "low")?,
        close: parse_field(record, 4, "close")?,
        volume: parse_field(record, 5, "volume")?,
    })
}

fn parse_field<T: std::str::FromStr>(
    record: &StringRecord,
    idx: usize,
    field: &'static str,
) -> Result<T, String> {
    let raw = record.get(idx).unwrap_or_default().trim();
    raw.parse::<T>()
        .map_err(|_| format!("invalid {field} value '{raw}'"))
}

fn normalize_to_millis(ts: i64) -> i64 {
    // Spot archives from 2025 onward carry microsecond timestamps.
    if ts.abs() >= 1_000_000_000_000_000 {
        ts / 1_000
    } else {
        ts
    }
}
