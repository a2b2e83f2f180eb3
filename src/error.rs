// =============================================================================
// Exchange error taxonomy — typed failures at the adapter boundary
// =============================================================================
//
// Wire-level failures (reqwest/tungstenite errors, HTTP statuses, venue
// error codes) are converted into `ExchangeError` inside the adapters.
// Policy per category:
//   Transport / RateLimit — absorbed by retry where the call is idempotent.
//   Auth / Venue          — surfaced to the caller.
//   Consistency           — fail the operation, never guess.
// =============================================================================

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Venue-specific code for "order would open or flip a position while
/// reduce-only is in force". Routed to the quarantine manager, not retried.
pub const REDUCE_ONLY_ERROR_CODE: i64 = 21740;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Connection refused, socket closed, request timeout.
    #[error("transport error: {0}")]
    Transport(String),

    /// Expired cookie, invalid signature, unauthorized.
    #[error("authentication error: {0}")]
    Auth(String),

    /// HTTP 429 or venue-specific throttle code. Carries the server-advised
    /// retry delay when one was provided.
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Order rejected, insufficient margin, and similar venue decisions.
    #[error("venue rejection ({code}): {message}")]
    Venue { code: i64, message: String },

    /// Stale book, missing instrument metadata, malformed payload.
    #[error("consistency error: {0}")]
    Consistency(String),

    /// Symbol outside the monitored universe; translation never guesses.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// Resource lookup missed (order not found etc.); callers may have a
    /// fallback path (e.g. order-history re-query).
    #[error("not found: {0}")]
    NotFound(String),

    /// The venue does not support this operation (e.g. batched submit).
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl ExchangeError {
    /// Reduce-only rejections get dedicated handling in the executor.
    pub fn is_reduce_only(&self) -> bool {
        matches!(self, Self::Venue { code, .. } if *code == REDUCE_ONLY_ERROR_CODE)
    }

    /// Whether an idempotent read may be retried after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimit { .. })
    }

    /// Classify an HTTP failure status + body into the taxonomy.
    pub fn from_http_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::Auth(format!("HTTP {status}: {body}")),
            404 => Self::NotFound(format!("HTTP 404: {body}")),
            429 => Self::RateLimit {
                message: body.to_string(),
                retry_after: None,
            },
            400 => Self::Venue {
                code: extract_venue_code(body).unwrap_or(400),
                message: body.to_string(),
            },
            _ => Self::Transport(format!("HTTP {status}: {body}")),
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Self::Transport(e.to_string())
        } else if e.is_status() {
            let status = e.status().map(|s| s.as_u16()).unwrap_or(0);
            Self::from_http_status(status, &e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Pull a numeric `"code"` field out of a venue error body, if present.
fn extract_venue_code(body: &str) -> Option<i64> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("code").and_then(|c| {
        c.as_i64()
            .or_else(|| c.as_str().and_then(|s| s.parse().ok()))
    })
}

// ---------------------------------------------------------------------------
// Retry helper for idempotent reads
// ---------------------------------------------------------------------------

/// Retry an idempotent async operation on transport / rate-limit errors.
///
/// Backoff doubles from `base` up to `max`, except that a rate-limit error
/// carrying a server-advised delay uses that delay verbatim.
pub async fn retry_idempotent<T, F, Fut>(
    label: &str,
    max_retries: u32,
    base: Duration,
    max: Duration,
    mut op: F,
) -> ExchangeResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ExchangeResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                let delay = match &e {
                    ExchangeError::RateLimit {
                        retry_after: Some(advised),
                        ..
                    } => *advised,
                    _ => {
                        let scaled = base.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
                        Duration::from_secs_f64(scaled.min(max.as_secs_f64()))
                    }
                };
                warn!(
                    op = label,
                    attempt,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient error"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn reduce_only_code_recognised() {
        let e = ExchangeError::Venue {
            code: REDUCE_ONLY_ERROR_CODE,
            message: "reduce only violation".into(),
        };
        assert!(e.is_reduce_only());
        assert!(!e.is_retryable());
    }

    #[test]
    fn http_status_classification() {
        assert!(matches!(
            ExchangeError::from_http_status(401, "bad sig"),
            ExchangeError::Auth(_)
        ));
        assert!(matches!(
            ExchangeError::from_http_status(429, "slow down"),
            ExchangeError::RateLimit { .. }
        ));
        assert!(matches!(
            ExchangeError::from_http_status(404, "no order"),
            ExchangeError::NotFound(_)
        ));
        assert!(matches!(
            ExchangeError::from_http_status(503, "maintenance"),
            ExchangeError::Transport(_)
        ));
    }

    #[test]
    fn venue_code_extracted_from_body() {
        let e = ExchangeError::from_http_status(400, r#"{"code": 21740, "msg": "reduce only"}"#);
        assert!(e.is_reduce_only());
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_idempotent(
            "test",
            3,
            Duration::from_millis(1),
            Duration::from_millis(5),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ExchangeError::Transport("flaky".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_on_business_errors() {
        let calls = AtomicU32::new(0);
        let result: ExchangeResult<()> = retry_idempotent(
            "test",
            3,
            Duration::from_millis(1),
            Duration::from_millis(5),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ExchangeError::Venue {
                        code: 1,
                        message: "rejected".into(),
                    })
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
