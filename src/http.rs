//! Thin HTTP seam shared by the Binance adapters.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;

use crate::sources::{SourceError, SourceErrorKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            retry_after: None,
            body: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport failures surface as `Err`; any HTTP status is an `Ok` response.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, SourceError>;
}

pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SourceError::permanent(format!("http client build failed: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, url: &str) -> Result<HttpResponse, SourceError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| SourceError::transient(format!("GET {url}: {err}")))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response
            .bytes()
            .await
            .map_err(|err| SourceError::transient(format!("GET {url} body: {err}")))?;

        Ok(HttpResponse {
            status,
            retry_after,
            body: body.to_vec(),
        })
    }
}

/// Error for a non-success status that both adapters classify the same way.
pub(crate) fn status_error(url: &str, response: &HttpResponse) -> SourceError {
    let kind = match response.status {
        429 | 418 => SourceErrorKind::RateLimited {
            retry_after: response.retry_after,
        },
        400 => SourceErrorKind::Permanent,
        403 | 404 => SourceErrorKind::NotFound,
        _ => SourceErrorKind::Transient,
    };
    let detail = String::from_utf8_lossy(&response.body);
    let detail = detail.trim();
    let message = if detail.is_empty() {
        format!("GET {url}: HTTP {}", response.status)
    } else {
        format!(
            "GET {url}: HTTP {}: {}",
            response.status,
            detail.chars().take(200).collect::<String>()
        )
    };
    SourceError::new(kind, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let mut limited = HttpResponse::status(429);
        limited.retry_after = Some(Duration::from_secs(3));
        assert_eq!(
            status_error("u", &limited).kind,
            SourceErrorKind::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert_eq!(
            status_error("u", &HttpResponse::status(400)).kind,
            SourceErrorKind::Permanent
        );
        assert_eq!(
            status_error("u", &HttpResponse::status(403)).kind,
            SourceErrorKind::NotFound
        );
        assert_eq!(
            status_error("u", &HttpResponse::status(503)).kind,
            SourceErrorKind::Transient
        );
    }
}
