use chrono::{NaiveDate, NaiveDateTime, Utc};
use dsm::{
    init_logging, log_app_start, log_request_start, logging_config_from_env, BarRequest,
    DataSourceManager, FcpConfig, GetDataOptions, HttpSourceConfig, Interval, MarketType,
    SourceTag,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    let fcp_cfg = FcpConfig::from_env()?;
    log_app_start("dsm_fetch", &logging_cfg, &fcp_cfg);

    let symbol = std::env::var("DSM_SYMBOL").unwrap_or_else(|_| "BTCUSDT".to_string());
    let market: MarketType = env_or("DSM_MARKET", "spot").parse()?;
    let interval: Interval = env_or("DSM_INTERVAL", "1h").parse()?;
    let enforce_source = match std::env::var("DSM_ENFORCE_SOURCE") {
        Ok(raw) if !raw.trim().is_empty() => Some(raw.parse::<SourceTag>()?),
        _ => None,
    };

    let now_ms = Utc::now().timestamp_millis();
    let start_ms = match std::env::var("DSM_START") {
        Ok(raw) => parse_timestamp(&raw)?,
        Err(_) => now_ms - 7 * dsm::DAY_MS,
    };
    let end_ms = match std::env::var("DSM_END") {
        Ok(raw) => parse_timestamp(&raw)?,
        Err(_) => now_ms,
    };

    let req = BarRequest {
        market,
        symbol,
        interval,
        start_ts_ms_utc: start_ms,
        end_ts_ms_utc_exclusive: end_ms,
    };
    log_request_start("dsm_fetch", &req, enforce_source.map(SourceTag::as_str));

    let manager = DataSourceManager::binance(fcp_cfg, &HttpSourceConfig::default())?;
    let opts = GetDataOptions {
        enforce_source,
        include_source: true,
        ..GetDataOptions::default()
    };
    let series = manager.get_data(&req, &opts).await?;

    if env_or("DSM_OUTPUT", "summary").eq_ignore_ascii_case("json") {
        println!("{}", serde_json::to_string_pretty(&series)?);
        return Ok(());
    }

    println!(
        "{} {} {} | window {}",
        series.symbol,
        series.market,
        series.interval.as_str(),
        series.range
    );
    println!(
        "  expected={} actual={} missing={} dupes_removed={} boundary_ticks={}",
        series.coverage.expected_points,
        series.coverage.actual_points,
        series.coverage.missing_points,
        series.coverage.duplicate_points_removed,
        series.coverage.boundary_tick_gaps
    );
    println!(
        "  cache_days={} fetches={} fallbacks={} persisted_days={}",
        series.stats.cache_days,
        series.stats.planned_fetches,
        series.stats.fallbacks,
        series.stats.persisted_days
    );

    if let Some(sources) = &series.sources {
        for tag in [SourceTag::Cache, SourceTag::BulkHistorical, SourceTag::Live] {
            let rows = sources.iter().filter(|source| **source == tag).count();
            if rows > 0 {
                println!("  {}: {} rows", tag, rows);
            }
        }
    }

    for warning in &series.warnings {
        println!(
            "  gap {} ({} bars missing)",
            warning.range, warning.missing_bars
        );
    }

    Ok(())
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

/// Accepts epoch milliseconds, `YYYY-MM-DD`, or `YYYY-MM-DDTHH:MM:SS` (UTC).
fn parse_timestamp(raw: &str) -> Result<i64, Box<dyn std::error::Error>> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt.and_utc().timestamp_millis());
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|err| format!("invalid timestamp '{raw}': {err}"))?;
    Ok(date.and_time(chrono::NaiveTime::MIN).and_utc().timestamp_millis())
}
