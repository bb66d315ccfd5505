//! Immutable configuration threaded through the data source manager.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::interval::HOUR_MS;
use crate::model::Provider;
use crate::retry::RetryConfig;

pub const DEFAULT_FRESHNESS_DELAY: Duration = Duration::from_secs(48 * 3_600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcpConfig {
    pub provider: Provider,
    pub cache_root: PathBuf,
    pub cache_enabled: bool,
    /// How far behind live trading the bulk historical export runs.
    pub freshness_delay: Duration,
    pub max_workers: usize,
    pub retry: RetryConfig,
    pub request_deadline: Duration,
    pub grace_period: Duration,
    /// Cache files older than this are treated as misses. `None` disables the check.
    pub max_cache_age: Option<Duration>,
    pub min_cache_file_bytes: u64,
    pub tolerate_boundary_tick_gaps: bool,
}

impl Default for FcpConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Binance,
            cache_root: PathBuf::from("data/cache"),
            cache_enabled: true,
            freshness_delay: DEFAULT_FRESHNESS_DELAY,
            max_workers: 8,
            retry: RetryConfig::default(),
            request_deadline: Duration::from_secs(300),
            grace_period: Duration::from_secs(5),
            max_cache_age: None,
            min_cache_file_bytes: 256,
            tolerate_boundary_tick_gaps: true,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl FcpConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(root) = env_value("DSM_CACHE_ROOT") {
            cfg.cache_root = PathBuf::from(root);
        }
        if let Some(raw) = env_value("DSM_CACHE_ENABLED") {
            cfg.cache_enabled = parse_bool(&raw).ok_or(ConfigError::InvalidValue {
                var: "DSM_CACHE_ENABLED",
                value: raw,
                reason: "expected a boolean",
            })?;
        }
        if let Some(hours) = parse_u64_var("DSM_FRESHNESS_DELAY_HOURS")? {
            cfg.freshness_delay = Duration::from_millis(hours.saturating_mul(HOUR_MS as u64));
        }
        if let Some(workers) = parse_u64_var("DSM_MAX_WORKERS")? {
            if workers == 0 {
                return Err(ConfigError::InvalidValue {
                    var: "DSM_MAX_WORKERS",
                    value: workers.to_string(),
                    reason: "must be at least 1",
                });
            }
            cfg.max_workers = usize::try_from(workers).unwrap_or(usize::MAX);
        }
        if let Some(secs) = parse_u64_var("DSM_REQUEST_DEADLINE_SECS")? {
            cfg.request_deadline = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_u64_var("DSM_GRACE_PERIOD_MS")? {
            cfg.grace_period = Duration::from_millis(ms);
        }
        if let Some(hours) = parse_u64_var("DSM_MAX_CACHE_AGE_HOURS")? {
            cfg.max_cache_age = Some(Duration::from_millis(hours.saturating_mul(HOUR_MS as u64)));
        }
        if let Some(attempts) = parse_u64_var("DSM_RETRY_MAX_ATTEMPTS")? {
            cfg.retry.max_attempts = u32::try_from(attempts.max(1)).unwrap_or(u32::MAX);
        }

        Ok(cfg)
    }
}

/// Endpoints and timeouts for the Binance Vision and REST adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSourceConfig {
    pub timeout: Duration,
    pub vision_base_url: String,
    pub spot_rest_url: String,
    pub futures_usdt_rest_url: String,
    pub futures_coin_rest_url: String,
    /// Vision 404s for days newer than this are reported as not yet published.
    pub vision_publish_lag: Duration,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            vision_base_url: "https://data.binance.vision/data".to_string(),
            spot_rest_url: "https://api.binance.com/api/v3/klines".to_string(),
            futures_usdt_rest_url: "https://fapi.binance.com/fapi/v1/klines".to_string(),
            futures_coin_rest_url: "https://dapi.binance.com/dapi/v1/klines".to_string(),
            vision_publish_lag: Duration::from_secs(3 * 24 * 3_600),
        }
    }
}

fn env_value(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_u64_var(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match env_value(var) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                var,
                value: raw,
                reason: "expected a non-negative integer",
            }),
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    pub(crate) fn with_env_vars<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, _)| ((*key).to_string(), env::var(key).ok()))
            .collect();

        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let output = f();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::test_env::with_env_vars;
    use super::*;

    const ALL_VARS: [&str; 8] = [
        "DSM_CACHE_ROOT",
        "DSM_CACHE_ENABLED",
        "DSM_FRESHNESS_DELAY_HOURS",
        "DSM_MAX_WORKERS",
        "DSM_REQUEST_DEADLINE_SECS",
        "DSM_GRACE_PERIOD_MS",
        "DSM_MAX_CACHE_AGE_HOURS",
        "DSM_RETRY_MAX_ATTEMPTS",
    ];

    fn cleared() -> Vec<(&'static str, Option<&'static str>)> {
        ALL_VARS.iter().map(|var| (*var, None)).collect()
    }

    #[test]
    fn defaults_when_env_missing() {
        let cfg = with_env_vars(&cleared(), FcpConfig::from_env).unwrap();
        assert_eq!(cfg, FcpConfig::default());
        assert_eq!(cfg.freshness_delay, Duration::from_secs(172_800));
    }

    #[test]
    fn parses_overrides_from_env() {
        let mut vars = cleared();
        vars.extend([
            ("DSM_CACHE_ROOT", Some("/tmp/dsm-cache")),
            ("DSM_CACHE_ENABLED", Some("off")),
            ("DSM_FRESHNESS_DELAY_HOURS", Some("24")),
            ("DSM_MAX_WORKERS", Some("2")),
            ("DSM_GRACE_PERIOD_MS", Some("750")),
            ("DSM_MAX_CACHE_AGE_HOURS", Some("720")),
        ]);
        let cfg = with_env_vars(&vars, FcpConfig::from_env).unwrap();

        assert_eq!(cfg.cache_root, PathBuf::from("/tmp/dsm-cache"));
        assert!(!cfg.cache_enabled);
        assert_eq!(cfg.freshness_delay, Duration::from_secs(86_400));
        assert_eq!(cfg.max_workers, 2);
        assert_eq!(cfg.grace_period, Duration::from_millis(750));
        assert_eq!(cfg.max_cache_age, Some(Duration::from_secs(720 * 3_600)));
    }

    #[test]
    fn rejects_unparseable_values_naming_the_variable() {
        let mut vars = cleared();
        vars.push(("DSM_MAX_WORKERS", Some("lots")));
        let err = with_env_vars(&vars, FcpConfig::from_env).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: "DSM_MAX_WORKERS",
                ..
            }
        ));

        let mut vars = cleared();
        vars.push(("DSM_MAX_WORKERS", Some("0")));
        assert!(with_env_vars(&vars, FcpConfig::from_env).is_err());
    }
}
