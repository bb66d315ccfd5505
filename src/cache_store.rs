//! Per-day Arrow IPC cache of complete kline days.
//!
//! Layout: `<root>/<provider>/<market>/<SYMBOL>/<interval>/<YYYY-MM-DD>.arrow`.
//! Files are only ever replaced whole, through a rename from a verified temp
//! file in the same directory.

use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arrow::array::{Array, ArrayRef, Float64Array, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::error::ArrowError;
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::FcpConfig;
use crate::interval::{day_range, Interval};
use crate::model::{Bar, MarketType, Provider, TimeRange};

const CACHE_FORMAT_VERSION: &str = "1";
const FILE_EXTENSION: &str = "arrow";
const META_VERSION: &str = "dsm.format_version";
const META_SYMBOL: &str = "dsm.symbol";
const META_INTERVAL: &str = "dsm.interval";
const META_DAY: &str = "dsm.day";
const META_COMPLETENESS: &str = "dsm.completeness";
const PRICE_COLUMNS: [&str; 5] = ["open", "high", "low", "close", "volume"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub provider: Provider,
    pub market: MarketType,
    pub symbol: String,
    pub interval: Interval,
    pub day: NaiveDate,
}

impl CacheKey {
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.provider.as_str())
            .join(self.market.as_str())
            .join(self.symbol.to_ascii_uppercase())
            .join(self.interval.as_str())
            .join(format!("{}.{FILE_EXTENSION}", self.day.format("%Y-%m-%d")))
    }

    pub fn day_range(&self) -> TimeRange {
        day_range(self.day)
    }

    pub fn expected_rows(&self) -> u64 {
        let range = self.day_range();
        self.interval.expected_count(range.start_ms, range.end_ms)
    }
}

/// Why a day qualifies as complete enough to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Full,
    /// The symbol started trading partway through the day.
    ListingDay,
}

impl Completeness {
    fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::ListingDay => "listing_day",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "full" => Some(Self::Full),
            "listing_day" => Some(Self::ListingDay),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheIntegrityError {
    #[error("cache file {path} not found")]
    Missing { path: PathBuf },
    #[error("cache file {path} is {size} bytes, below minimum {min}")]
    TooSmall { path: PathBuf, size: u64, min: u64 },
    #[error("cache file {path} is {age_secs}s old, above maximum {max_secs}s")]
    Stale {
        path: PathBuf,
        age_secs: u64,
        max_secs: u64,
    },
    #[error("cache file {path} has unexpected schema: {detail}")]
    Schema { path: PathBuf, detail: String },
    #[error("cache file {path} holds {found} rows, expected {expected}")]
    RowCount {
        path: PathBuf,
        expected: u64,
        found: u64,
    },
    #[error("cache file {path} has invalid rows: {detail}")]
    InvalidRows { path: PathBuf, detail: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
}

#[derive(Debug, Error)]
pub enum CacheWriteError {
    #[error("refusing to cache {key_day}: {reason}")]
    Rejected { key_day: NaiveDate, reason: String },
    #[error("temp file for {path} failed verification: {detail}")]
    VerifyFailed { path: PathBuf, detail: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    min_file_bytes: u64,
    max_age: Option<Duration>,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>, min_file_bytes: u64, max_age: Option<Duration>) -> Self {
        Self {
            root: root.into(),
            min_file_bytes,
            max_age,
        }
    }

    pub fn from_config(cfg: &FcpConfig) -> Self {
        Self::new(
            cfg.cache_root.clone(),
            cfg.min_cache_file_bytes,
            cfg.max_cache_age,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    /// Returns the cached day, or `None` on a miss. Integrity failures are
    /// logged and reported as misses.
    pub fn read(&self, key: &CacheKey) -> Option<Vec<Bar>> {
        match self.inspect(key) {
            Ok(bars) => {
                debug!(
                    component = "cache_store",
                    event = "dsm.cache.hit",
                    symbol = %key.symbol,
                    interval = key.interval.as_str(),
                    day = %key.day,
                    rows = bars.len()
                );
                Some(bars)
            }
            Err(CacheIntegrityError::Missing { .. }) => {
                debug!(
                    component = "cache_store",
                    event = "dsm.cache.miss",
                    symbol = %key.symbol,
                    interval = key.interval.as_str(),
                    day = %key.day
                );
                None
            }
            Err(err) => {
                warn!(
                    component = "cache_store",
                    event = "dsm.cache.integrity_failed",
                    symbol = %key.symbol,
                    interval = key.interval.as_str(),
                    day = %key.day,
                    error = %err
                );
                None
            }
        }
    }

    /// Reads and fully validates one cache file.
    pub fn inspect(&self, key: &CacheKey) -> Result<Vec<Bar>, CacheIntegrityError> {
        let path = self.path_for(key);
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheIntegrityError::Missing { path });
            }
            Err(err) => return Err(err.into()),
        };

        if meta.len() < self.min_file_bytes {
            return Err(CacheIntegrityError::TooSmall {
                path,
                size: meta.len(),
                min: self.min_file_bytes,
            });
        }

        if let Some(max_age) = self.max_age {
            let age = meta
                .modified()
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .unwrap_or_default();
            if age > max_age {
                return Err(CacheIntegrityError::Stale {
                    path,
                    age_secs: age.as_secs(),
                    max_secs: max_age.as_secs(),
                });
            }
        }

        let (bars, metadata) = read_ipc(&path)?;
        validate_metadata(&path, key, &metadata)?;
        let completeness = metadata
            .get(META_COMPLETENESS)
            .and_then(|raw| Completeness::parse(raw))
            .ok_or_else(|| CacheIntegrityError::Schema {
                path: path.clone(),
                detail: "missing completeness marker".to_string(),
            })?;

        if let Err(detail) = check_day_rows(key, &bars, completeness) {
            return Err(match detail {
                DayRowsProblem::Count { expected, found } => CacheIntegrityError::RowCount {
                    path,
                    expected,
                    found,
                },
                DayRowsProblem::Rows(detail) => CacheIntegrityError::InvalidRows { path, detail },
            });
        }

        Ok(bars)
    }

    /// Atomically replaces the file for `key` with a complete, closed day.
    pub fn write(
        &self,
        key: &CacheKey,
        bars: &[Bar],
        completeness: Completeness,
        now_ms: i64,
    ) -> Result<PathBuf, CacheWriteError> {
        let day_range = key.day_range();
        if day_range.end_ms > now_ms {
            return Err(CacheWriteError::Rejected {
                key_day: key.day,
                reason: "day has not closed yet".to_string(),
            });
        }
        if let Err(problem) = check_day_rows(key, bars, completeness) {
            return Err(CacheWriteError::Rejected {
                key_day: key.day,
                reason: problem.to_string(),
            });
        }

        let final_path = self.path_for(key);
        let dir = final_path.parent().ok_or_else(|| CacheWriteError::Rejected {
            key_day: key.day,
            reason: format!("invalid cache path {}", final_path.display()),
        })?;
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".dsm-")
            .suffix(".tmp")
            .tempfile_in(dir)?;

        let schema = Arc::new(cache_schema(key, completeness));
        let batch = bars_to_batch(Arc::clone(&schema), bars)?;
        {
            let mut writer = FileWriter::try_new(tmp.as_file_mut(), &schema)?;
            writer.write(&batch)?;
            writer.finish()?;
        }
        tmp.as_file().sync_all()?;

        let (written, _) = read_ipc(tmp.path()).map_err(|err| CacheWriteError::VerifyFailed {
            path: final_path.clone(),
            detail: err.to_string(),
        })?;
        if written.len() != bars.len() || !strictly_increasing(&written) {
            return Err(CacheWriteError::VerifyFailed {
                path: final_path,
                detail: format!(
                    "wrote {} rows, read back {} (ordered: {})",
                    bars.len(),
                    written.len(),
                    strictly_increasing(&written)
                ),
            });
        }

        tmp.persist(&final_path).map_err(|err| err.error)?;
        info!(
            component = "cache_store",
            event = "dsm.cache.written",
            symbol = %key.symbol,
            interval = key.interval.as_str(),
            day = %key.day,
            rows = bars.len(),
            completeness = completeness.as_str(),
            path = %final_path.display()
        );
        Ok(final_path)
    }
}

#[derive(Debug)]
enum DayRowsProblem {
    Count { expected: u64, found: u64 },
    Rows(String),
}

impl std::fmt::Display for DayRowsProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Count { expected, found } => {
                write!(f, "expected {expected} rows, found {found}")
            }
            Self::Rows(detail) => f.write_str(detail),
        }
    }
}

fn check_day_rows(
    key: &CacheKey,
    bars: &[Bar],
    completeness: Completeness,
) -> Result<(), DayRowsProblem> {
    let range = key.day_range();
    let expected = key.expected_rows();
    let found = bars.len() as u64;

    if !key.interval.fits_calendar_day() {
        return Err(DayRowsProblem::Rows(format!(
            "interval {} does not tile a calendar day",
            key.interval
        )));
    }
    if let Some(bad) = bars.iter().find(|bar| !range.contains(bar.open_time_ms)) {
        return Err(DayRowsProblem::Rows(format!(
            "open time {} outside day {}",
            bad.open_time_ms, key.day
        )));
    }
    if let Some(bad) = bars
        .iter()
        .find(|bar| !key.interval.is_aligned(bar.open_time_ms))
    {
        return Err(DayRowsProblem::Rows(format!(
            "open time {} not aligned to {}",
            bad.open_time_ms, key.interval
        )));
    }
    if !strictly_increasing(bars) {
        return Err(DayRowsProblem::Rows(
            "open times are not strictly increasing".to_string(),
        ));
    }
    if let Some(bad) = bars.iter().find(|bar| !bar.is_valid()) {
        return Err(DayRowsProblem::Rows(format!(
            "invalid OHLCV values at {}",
            bad.open_time_ms
        )));
    }

    match completeness {
        Completeness::Full if found == expected => Ok(()),
        Completeness::Full => Err(DayRowsProblem::Count { expected, found }),
        Completeness::ListingDay => {
            let first = bars.first().map(|bar| bar.open_time_ms).unwrap_or(range.end_ms);
            let tail = key.interval.expected_count(first, range.end_ms);
            if found == 0 || found >= expected || found != tail {
                Err(DayRowsProblem::Count {
                    expected: tail,
                    found,
                })
            } else {
                Ok(())
            }
        }
    }
}

fn strictly_increasing(bars: &[Bar]) -> bool {
    bars.windows(2)
        .all(|pair| pair[0].open_time_ms < pair[1].open_time_ms)
}

fn cache_schema(key: &CacheKey, completeness: Completeness) -> Schema {
    let mut fields = vec![Field::new(
        "open_time",
        DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
        false,
    )];
    fields.extend(
        PRICE_COLUMNS
            .iter()
            .map(|name| Field::new(*name, DataType::Float64, false)),
    );

    let metadata = HashMap::from([
        (META_VERSION.to_string(), CACHE_FORMAT_VERSION.to_string()),
        (META_SYMBOL.to_string(), key.symbol.to_ascii_uppercase()),
        (META_INTERVAL.to_string(), key.interval.as_str().to_string()),
        (META_DAY.to_string(), key.day.format("%Y-%m-%d").to_string()),
        (
            META_COMPLETENESS.to_string(),
            completeness.as_str().to_string(),
        ),
    ]);
    Schema::new_with_metadata(fields, metadata)
}

fn bars_to_batch(schema: Arc<Schema>, bars: &[Bar]) -> Result<RecordBatch, ArrowError> {
    let open_times: Vec<i64> = bars.iter().map(|bar| bar.open_time_ms).collect();
    let columns: Vec<ArrayRef> = vec![
        Arc::new(TimestampMillisecondArray::from(open_times).with_timezone("UTC")),
        Arc::new(Float64Array::from_iter_values(bars.iter().map(|b| b.open))),
        Arc::new(Float64Array::from_iter_values(bars.iter().map(|b| b.high))),
        Arc::new(Float64Array::from_iter_values(bars.iter().map(|b| b.low))),
        Arc::new(Float64Array::from_iter_values(bars.iter().map(|b| b.close))),
        Arc::new(Float64Array::from_iter_values(bars.iter().map(|b| b.volume))),
    ];
    RecordBatch::try_new(schema, columns)
}

fn read_ipc(path: &Path) -> Result<(Vec<Bar>, HashMap<String, String>), CacheIntegrityError> {
    let file = fs::File::open(path)?;
    let reader = FileReader::try_new(BufReader::new(file), None)?;
    let schema = reader.schema();
    validate_columns(path, &schema)?;
    let metadata = schema.metadata().clone();

    let mut bars = Vec::new();
    for batch in reader {
        let batch = batch?;
        let open_times = column::<TimestampMillisecondArray>(path, &batch, 0)?;
        let prices: Vec<&Float64Array> = (1..=PRICE_COLUMNS.len())
            .map(|idx| column::<Float64Array>(path, &batch, idx))
            .collect::<Result<_, _>>()?;

        for row in 0..batch.num_rows() {
            bars.push(Bar {
                open_time_ms: open_times.value(row),
                open: prices[0].value(row),
                high: prices[1].value(row),
                low: prices[2].value(row),
                close: prices[3].value(row),
                volume: prices[4].value(row),
            });
        }
    }

    Ok((bars, metadata))
}

fn validate_columns(path: &Path, schema: &Schema) -> Result<(), CacheIntegrityError> {
    let fields = schema.fields();
    if fields.len() != 1 + PRICE_COLUMNS.len() {
        return Err(CacheIntegrityError::Schema {
            path: path.to_path_buf(),
            detail: format!("expected 6 columns, found {}", fields.len()),
        });
    }
    let open_time_ok = fields[0].name() == "open_time"
        && matches!(
            fields[0].data_type(),
            DataType::Timestamp(TimeUnit::Millisecond, _)
        );
    let prices_ok = PRICE_COLUMNS
        .iter()
        .zip(fields.iter().skip(1))
        .all(|(name, field)| field.name() == name && field.data_type() == &DataType::Float64);
    if !open_time_ok || !prices_ok {
        return Err(CacheIntegrityError::Schema {
            path: path.to_path_buf(),
            detail: "column names or types differ from open_time/OHLCV".to_string(),
        });
    }
    Ok(())
}

fn validate_metadata(
    path: &Path,
    key: &CacheKey,
    metadata: &HashMap<String, String>,
) -> Result<(), CacheIntegrityError> {
    let day = key.day.format("%Y-%m-%d").to_string();
    let symbol = key.symbol.to_ascii_uppercase();
    let expectations = [
        (META_VERSION, CACHE_FORMAT_VERSION),
        (META_SYMBOL, symbol.as_str()),
        (META_INTERVAL, key.interval.as_str()),
        (META_DAY, day.as_str()),
    ];
    for (name, expected) in expectations {
        let found = metadata.get(name).map(String::as_str);
        if found != Some(expected) {
            return Err(CacheIntegrityError::Schema {
                path: path.to_path_buf(),
                detail: format!("metadata {name} is {found:?}, expected '{expected}'"),
            });
        }
    }
    Ok(())
}

fn column<'a, T: 'static>(
    path: &Path,
    batch: &'a RecordBatch,
    idx: usize,
) -> Result<&'a T, CacheIntegrityError> {
    let array = batch.column(idx);
    if array.null_count() > 0 {
        return Err(CacheIntegrityError::Schema {
            path: path.to_path_buf(),
            detail: format!("column {idx} contains nulls"),
        });
    }
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| CacheIntegrityError::Schema {
            path: path.to_path_buf(),
            detail: format!("column {idx} has an unexpected array type"),
        })
}
