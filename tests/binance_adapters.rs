#![cfg(feature = "live-binance-tests")]

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use dsm::{
    day_range, BarSource, DataSourceManager, FcpConfig, GetDataOptions, HttpSourceConfig,
    Interval, MarketType, RestClient, SourceRequest, SourceTag, VisionClient, HOUR_MS,
};
use tempfile::tempdir;

fn old_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 15).expect("valid day")
}

#[tokio::test]
async fn vision_archive_serves_a_full_old_day() {
    let vision = VisionClient::new(&HttpSourceConfig::default()).expect("vision client");
    let req = SourceRequest {
        market: MarketType::Spot,
        symbol: "BTCUSDT".to_string(),
        interval: Interval::Hour1,
        range: day_range(old_day()),
    };

    let bars = vision.fetch(&req).await.expect("archive should be published");
    assert_eq!(bars.len(), 24);
    assert!(bars.iter().all(|bar| bar.is_valid()));
    assert!(bars
        .windows(2)
        .all(|pair| pair[1].open_time_ms - pair[0].open_time_ms == HOUR_MS));
}

#[tokio::test]
async fn rest_and_vision_agree_on_an_old_day() {
    let http = HttpSourceConfig::default();
    let vision = VisionClient::new(&http).expect("vision client");
    let rest = RestClient::new(&http).expect("rest client");

    for market in [MarketType::Spot, MarketType::FuturesUsdt] {
        let req = SourceRequest {
            market,
            symbol: "ETHUSDT".to_string(),
            interval: Interval::Hour4,
            range: day_range(old_day()),
        };
        let archived = vision.fetch(&req).await.expect("vision day");
        let live = rest.fetch(&req).await.expect("rest day");
        assert_eq!(archived.len(), 6, "{market}");
        assert_eq!(archived, live, "{market}");
    }
}

#[tokio::test]
async fn manager_straddles_the_freshness_boundary_against_binance() {
    let temp = tempdir().expect("tempdir");
    let cfg = FcpConfig {
        cache_root: temp.path().to_path_buf(),
        ..FcpConfig::default()
    };
    let dsm = DataSourceManager::binance(cfg, &HttpSourceConfig::default()).expect("manager");

    let now = Utc::now();
    let start = (now - ChronoDuration::days(5)).timestamp_millis();
    let end = (now - ChronoDuration::hours(1)).timestamp_millis();
    let req = dsm::BarRequest {
        market: MarketType::Spot,
        symbol: "BTCUSDT".to_string(),
        interval: Interval::Hour1,
        start_ts_ms_utc: start,
        end_ts_ms_utc_exclusive: end,
    };
    let opts = GetDataOptions {
        include_source: true,
        ..GetDataOptions::default()
    };

    let series = dsm.get_data(&req, &opts).await.expect("live request");
    let sources = series.sources.expect("sources requested");
    assert!(series.coverage.missing_points <= 1);
    assert!(sources.contains(&SourceTag::Live));
    assert!(series.stats.persisted_days >= 1);
}
