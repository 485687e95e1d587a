//! Provider error classification.
//!
//! Every upstream failure lands in one of four buckets; the router treats
//! `RateLimited` and `Retryable` as demote-and-try-next, the rest propagate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited{}", retry_suffix(*retry_after_ms))]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("authentication rejected by provider")]
    Auth,

    #[error("retryable provider failure: {0}")]
    Retryable(String),

    #[error("provider failure: {0}")]
    Fatal(String),

    #[error("cancelled")]
    Cancelled,
}

fn retry_suffix(ms: Option<u64>) -> String {
    match ms {
        Some(ms) => format!(" (retry after {ms}ms)"),
        None => String::new(),
    }
}

impl ProviderError {
    /// Whether the router may demote this provider and try the next candidate.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Retryable(_))
    }

    /// Classify an HTTP error status plus body snippet.
    #[must_use]
    pub fn from_status(status: reqwest::StatusCode, retry_after_ms: Option<u64>, body: &str) -> Self {
        match status.as_u16() {
            401 | 403 => Self::Auth,
            429 => Self::RateLimited { retry_after_ms },
            500..=599 => Self::Retryable(format!("HTTP {status}: {}", truncate(body, 200))),
            _ => Self::Fatal(format!("HTTP {status}: {}", truncate(body, 200))),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Self::Retryable(e.to_string())
        } else {
            Self::Fatal(e.to_string())
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Parse `Retry-After` as milliseconds.
///
/// `Retry-After` may be either delta-seconds or an HTTP date; providers
/// return delta-seconds for 429, which is all we consume.
#[must_use]
pub fn retry_after_ms_from_headers(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?;
    let text = value.to_str().ok()?.trim();
    let seconds = text.parse::<u64>().ok()?;
    seconds.checked_mul(1_000)
}

pub type Result<T> = std::result::Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let s = reqwest::StatusCode::from_u16;
        assert!(matches!(
            ProviderError::from_status(s(401).unwrap(), None, ""),
            ProviderError::Auth
        ));
        assert!(matches!(
            ProviderError::from_status(s(429).unwrap(), Some(1500), ""),
            ProviderError::RateLimited {
                retry_after_ms: Some(1500)
            }
        ));
        assert!(matches!(
            ProviderError::from_status(s(503).unwrap(), None, "overloaded"),
            ProviderError::Retryable(_)
        ));
        assert!(matches!(
            ProviderError::from_status(s(400).unwrap(), None, "bad arg"),
            ProviderError::Fatal(_)
        ));
    }

    #[test]
    fn retryability() {
        assert!(
            ProviderError::RateLimited {
                retry_after_ms: None
            }
            .is_retryable()
        );
        assert!(ProviderError::Retryable("x".into()).is_retryable());
        assert!(!ProviderError::Auth.is_retryable());
        assert!(!ProviderError::Fatal("x".into()).is_retryable());
    }

    #[test]
    fn retry_after_parses_delta_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::RETRY_AFTER,
            reqwest::header::HeaderValue::from_static("2"),
        );
        assert_eq!(retry_after_ms_from_headers(&headers), Some(2_000));
    }
}
