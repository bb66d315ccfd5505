use chrono::{Duration, NaiveDate, Utc};
use dsm::{
    init_logging, log_app_start, logging_config_from_env, CacheIntegrityError, CacheKey,
    CacheStore, FcpConfig, Interval, MarketType,
};

#[derive(Default, Debug, Clone, Copy)]
struct Totals {
    valid: u64,
    missing: u64,
    invalid: u64,
    rows: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    let fcp_cfg = FcpConfig::from_env()?;
    log_app_start("dsm_cache_audit", &logging_cfg, &fcp_cfg);

    let symbol = std::env::var("DSM_SYMBOL")
        .unwrap_or_else(|_| "BTCUSDT".to_string())
        .trim()
        .to_ascii_uppercase();
    let market: MarketType = env_or("DSM_MARKET", "spot").parse()?;
    let interval: Interval = env_or("DSM_INTERVAL", "1h").parse()?;
    if !interval.fits_calendar_day() {
        return Err(format!("interval {} is never cached", interval.as_str()).into());
    }

    let today_utc = Utc::now().date_naive();
    let start_date = match std::env::var("DSM_START") {
        Ok(raw) => parse_date("DSM_START", &raw)?,
        Err(_) => today_utc - Duration::days(30),
    };
    // Exclusive; defaults to today, the first day that cannot be cached yet.
    let end_date = match std::env::var("DSM_END") {
        Ok(raw) => parse_date("DSM_END", &raw)?,
        Err(_) => today_utc,
    };
    if end_date <= start_date {
        return Err(
            format!("invalid audit range: start={start_date} end={end_date} (exclusive)").into(),
        );
    }

    let store = CacheStore::from_config(&fcp_cfg);
    println!(
        "Auditing cache {} | {} {} {} from {} to {} (exclusive)",
        store.root().display(),
        symbol,
        market,
        interval.as_str(),
        start_date,
        end_date
    );

    let mut totals = Totals::default();
    for day in start_date.iter_days().take_while(|day| *day < end_date) {
        let key = CacheKey {
            provider: fcp_cfg.provider,
            market,
            symbol: symbol.clone(),
            interval,
            day,
        };
        match store.inspect(&key) {
            Ok(bars) => {
                totals.valid += 1;
                totals.rows += bars.len() as u64;
                if (bars.len() as u64) < key.expected_rows() {
                    println!(
                        "  {} short day: {} of {} rows",
                        day,
                        bars.len(),
                        key.expected_rows()
                    );
                }
            }
            Err(CacheIntegrityError::Missing { .. }) => totals.missing += 1,
            Err(err) => {
                totals.invalid += 1;
                println!("  {} invalid: {}", day, err);
            }
        }
    }

    println!(
        "\nTOTAL | valid={} missing={} invalid={} rows={}",
        totals.valid, totals.missing, totals.invalid, totals.rows
    );

    if totals.invalid == 0 {
        println!("RESULT: no invalid cache files in audited range.");
        Ok(())
    } else {
        Err(format!(
            "{} invalid cache files; they will be refetched on the next request",
            totals.invalid
        )
        .into())
    }
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn parse_date(var: &str, raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("{var} must be YYYY-MM-DD, got '{raw}': {err}"))
}
