//! Boundary contract for the bulk-historical and live bar collaborators.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::interval::Interval;
use crate::model::{Bar, MarketType, SourceTag, TimeRange};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRequest {
    pub market: MarketType,
    pub symbol: String,
    pub interval: Interval,
    pub range: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceErrorKind {
    RateLimited { retry_after: Option<Duration> },
    Transient,
    /// Bulk export for the period has not been published yet.
    NotYetAvailable,
    ChecksumMismatch,
    /// Delisted symbol or unsupported combination.
    NotFound,
    Permanent,
}

impl SourceErrorKind {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Transient => true,
            Self::NotYetAvailable | Self::ChecksumMismatch | Self::NotFound | Self::Permanent => {
                false
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Transient => "transient",
            Self::NotYetAvailable => "not_yet_available",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::NotFound => "not_found",
            Self::Permanent => "permanent",
        }
    }
}

impl fmt::Display for SourceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited {
                retry_after: Some(after),
            } => write!(f, "rate_limited (retry after {}ms)", after.as_millis()),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub message: String,
}

impl SourceError {
    pub fn new(kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Permanent, message)
    }
}

/// A remote collaborator that can serve bars for one request range.
///
/// Implementations must not be handed ranges larger than
/// [`BarSource::max_rows_per_call`]; the fetch coordinator chunks first.
#[async_trait]
pub trait BarSource: Send + Sync {
    fn tag(&self) -> SourceTag;

    fn supports(&self, market: MarketType, interval: Interval) -> bool;

    fn max_rows_per_call(&self, market: MarketType, interval: Interval) -> u64;

    async fn fetch(&self, req: &SourceRequest) -> Result<Vec<Bar>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limits_and_transport_errors_are_transient() {
        assert!(SourceErrorKind::RateLimited { retry_after: None }.is_transient());
        assert!(SourceErrorKind::Transient.is_transient());
        for kind in [
            SourceErrorKind::NotYetAvailable,
            SourceErrorKind::ChecksumMismatch,
            SourceErrorKind::NotFound,
            SourceErrorKind::Permanent,
        ] {
            assert!(!kind.is_transient(), "{kind}");
        }
    }

    #[test]
    fn display_includes_retry_hint() {
        let err = SourceError::new(
            SourceErrorKind::RateLimited {
                retry_after: Some(Duration::from_secs(2)),
            },
            "HTTP 429",
        );
        assert_eq!(err.to_string(), "rate_limited (retry after 2000ms): HTTP 429");
    }
}
