//! Shared logging configuration and initialization.

use std::env;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{parse_bool, FcpConfig};
use crate::manager::BarRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Ok(level) = env::var("DSM_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }

    if let Ok(format) = env::var("DSM_LOG_FORMAT") {
        if let Some(parsed) = parse_log_format(&format) {
            config.format = parsed;
        }
    }

    if let Ok(include_target) = env::var("DSM_LOG_TARGET") {
        if let Some(parsed) = parse_bool(&include_target) {
            config.include_target = parsed;
        }
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(app: &str, logging: &LoggingConfig, fcp: &FcpConfig) {
    info!(
        component = app,
        event = "app.start",
        log_level = %logging.level,
        log_format = ?logging.format,
        cache_root = %fcp.cache_root.display(),
        cache_enabled = fcp.cache_enabled,
        freshness_delay_hours = fcp.freshness_delay.as_secs() / 3_600,
        max_workers = fcp.max_workers,
        request_deadline_secs = fcp.request_deadline.as_secs()
    );
}

pub fn log_request_start(app: &str, req: &BarRequest, enforce_source: Option<&str>) {
    match enforce_source {
        Some(source) => info!(
            component = app,
            event = "app.request",
            symbol = %req.symbol,
            market = req.market.as_str(),
            interval = req.interval.as_str(),
            start_ms = req.start_ts_ms_utc,
            end_ms = req.end_ts_ms_utc_exclusive,
            enforce_source = source
        ),
        None => info!(
            component = app,
            event = "app.request",
            symbol = %req.symbol,
            market = req.market.as_str(),
            interval = req.interval.as_str(),
            start_ms = req.start_ts_ms_utc,
            end_ms = req.end_ts_ms_utc_exclusive
        ),
    }
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_env::with_env_vars;

    #[test]
    fn defaults_when_env_missing() {
        let cfg = with_env_vars(
            &[
                ("DSM_LOG_LEVEL", None),
                ("DSM_LOG_FORMAT", None),
                ("DSM_LOG_TARGET", None),
            ],
            logging_config_from_env,
        );

        assert_eq!(cfg, LoggingConfig::default());
    }

    #[test]
    fn parses_json_and_level_and_target_from_env() {
        let cfg = with_env_vars(
            &[
                ("DSM_LOG_LEVEL", Some("dsm=debug,info")),
                ("DSM_LOG_FORMAT", Some("json")),
                ("DSM_LOG_TARGET", Some("false")),
            ],
            logging_config_from_env,
        );

        assert_eq!(cfg.level, "dsm=debug,info");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(!cfg.include_target);
    }

    #[test]
    fn invalid_format_or_target_falls_back_to_defaults() {
        let cfg = with_env_vars(
            &[
                ("DSM_LOG_LEVEL", Some("trace")),
                ("DSM_LOG_FORMAT", Some("yaml")),
                ("DSM_LOG_TARGET", Some("maybe")),
            ],
            logging_config_from_env,
        );

        assert_eq!(cfg.level, "trace");
        assert_eq!(cfg.format, LogFormat::Pretty);
        assert!(cfg.include_target);
    }
}
