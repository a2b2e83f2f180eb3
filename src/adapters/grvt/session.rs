// =============================================================================
// GRVT Session — environment matrix, API-key login, cookie refresh
// =============================================================================
//
// Every GRVT endpoint is a POST. Market-data calls are unauthenticated;
// trade/account calls need the `gravity` session cookie plus the
// `X-Grvt-Account-Id` header, both obtained by POSTing the API key to the
// edge login endpoint. The cookie is refreshed when fewer than 10 seconds
// of validity remain.
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::error::{ExchangeError, ExchangeResult};

/// Refresh margin: re-login when the cookie has less than this left.
const COOKIE_REFRESH_MARGIN_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrvtEnv {
    Prod,
    Testnet,
}

#[derive(Debug, Clone)]
pub struct GrvtEndpoints {
    pub edge_rpc: String,
    pub trade_rpc: String,
    pub market_rpc: String,
    pub trade_ws: String,
    pub market_ws: String,
    pub chain_id: u64,
}

impl GrvtEndpoints {
    pub fn for_env(env: GrvtEnv) -> Self {
        match env {
            GrvtEnv::Prod => Self {
                edge_rpc: "https://edge.grvt.io".into(),
                trade_rpc: "https://trades.grvt.io".into(),
                market_rpc: "https://market-data.grvt.io".into(),
                trade_ws: "wss://trades.grvt.io/ws".into(),
                market_ws: "wss://market-data.grvt.io/ws".into(),
                chain_id: 325,
            },
            GrvtEnv::Testnet => Self {
                edge_rpc: "https://edge.testnet.grvt.io".into(),
                trade_rpc: "https://trades.testnet.grvt.io".into(),
                market_rpc: "https://market-data.testnet.grvt.io".into(),
                trade_ws: "wss://trades.testnet.grvt.io/ws".into(),
                market_ws: "wss://market-data.testnet.grvt.io/ws".into(),
                chain_id: 326,
            },
        }
    }
}

/// Unix-nanosecond timestamp string, the venue's native time encoding.
pub fn datetime_to_unix_ns(dt: DateTime<Utc>) -> String {
    (dt.timestamp_nanos_opt().unwrap_or(0)).to_string()
}

pub fn unix_ns_to_datetime(ns: &str) -> DateTime<Utc> {
    ns.parse::<i64>()
        .map(DateTime::from_timestamp_nanos)
        .unwrap_or_else(|_| Utc::now())
}

#[derive(Debug, Clone)]
struct CookieState {
    gravity: String,
    expires_at: Option<DateTime<Utc>>,
    account_id: Option<String>,
}

pub struct GrvtSession {
    api_key: String,
    pub endpoints: GrvtEndpoints,
    pub sub_account_id: String,
    client: reqwest::Client,
    cookie: Mutex<Option<CookieState>>,
    /// Serializes the login/refresh sequence so concurrent trade calls do
    /// not race a double login.
    login_lock: AsyncMutex<()>,
}

impl GrvtSession {
    pub fn new(api_key: String, sub_account_id: String, testnet: bool) -> Self {
        let env = if testnet { GrvtEnv::Testnet } else { GrvtEnv::Prod };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            api_key,
            endpoints: GrvtEndpoints::for_env(env),
            sub_account_id,
            client,
            cookie: Mutex::new(None),
            login_lock: AsyncMutex::new(()),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.endpoints.chain_id
    }

    /// Session credentials for WebSocket upgrade headers, if logged in:
    /// `(cookie_value, account_id)`.
    pub fn ws_credentials(&self) -> Option<(String, String)> {
        let guard = self.cookie.lock();
        guard.as_ref().and_then(|c| {
            c.account_id
                .as_ref()
                .map(|id| (format!("gravity={}", c.gravity), id.clone()))
        })
    }

    pub fn drop_session(&self) {
        *self.cookie.lock() = None;
    }

    // -------------------------------------------------------------------------
    // Login & refresh
    // -------------------------------------------------------------------------

    pub async fn login(&self) -> ExchangeResult<()> {
        if self.api_key.is_empty() {
            return Err(ExchangeError::Auth("grvt: api_key not configured".into()));
        }
        let _guard = self.login_lock.lock().await;

        let url = format!("{}/auth/api_key/login", self.endpoints.edge_rpc);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "api_key": self.api_key }))
            .send()
            .await
            .map_err(ExchangeError::from)?;

        let status = resp.status();
        // Headers must be read before the body consumes the response.
        let set_cookie = resp
            .headers()
            .get("Set-Cookie")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let account_id = resp
            .headers()
            .get("X-Grvt-Account-Id")
            .or_else(|| resp.headers().get("x-grvt-account-id"))
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = resp.text().await.map_err(ExchangeError::from)?;

        if !status.is_success() {
            return Err(ExchangeError::Auth(format!(
                "grvt login failed: status={status} body={}",
                &body[..body.len().min(500)]
            )));
        }

        let cookie_header = set_cookie
            .ok_or_else(|| ExchangeError::Auth("grvt login: no Set-Cookie header".into()))?;
        let (gravity, expires_at) = parse_gravity_cookie(&cookie_header)
            .ok_or_else(|| ExchangeError::Auth("grvt login: no gravity cookie".into()))?;

        debug!(
            has_account_id = account_id.is_some(),
            expires = ?expires_at,
            "grvt session established"
        );
        *self.cookie.lock() = Some(CookieState {
            gravity,
            expires_at,
            account_id,
        });
        info!("grvt login ok");
        Ok(())
    }

    /// Ensure a live session before a trade POST; refreshes when the cookie
    /// is missing or about to expire.
    pub async fn ensure_authenticated(&self) -> ExchangeResult<()> {
        let needs_login = {
            let guard = self.cookie.lock();
            match guard.as_ref() {
                None => true,
                Some(state) => match state.expires_at {
                    Some(expiry) => {
                        (expiry - Utc::now()).num_seconds() < COOKIE_REFRESH_MARGIN_SECS
                    }
                    None => false,
                },
            }
        };
        if needs_login {
            self.login().await?;
        }
        Ok(())
    }

    fn auth_headers(&self) -> Vec<(String, String)> {
        let guard = self.cookie.lock();
        let mut headers = Vec::new();
        if let Some(state) = guard.as_ref() {
            headers.push(("Cookie".to_string(), format!("gravity={}", state.gravity)));
            if let Some(id) = &state.account_id {
                headers.push(("X-Grvt-Account-Id".to_string(), id.clone()));
            }
        }
        headers
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// Unauthenticated market-data POST.
    pub async fn post_market(&self, path: &str, payload: Value) -> ExchangeResult<Value> {
        let url = format!("{}/{}", self.endpoints.market_rpc, path.trim_start_matches('/'));
        self.post(&url, payload, false).await
    }

    /// Authenticated trade/account POST (30 s timeout).
    pub async fn post_trade(&self, path: &str, payload: Value) -> ExchangeResult<Value> {
        self.ensure_authenticated().await?;
        let url = format!("{}/{}", self.endpoints.trade_rpc, path.trim_start_matches('/'));
        self.post(&url, payload, true).await
    }

    async fn post(&self, url: &str, payload: Value, authed: bool) -> ExchangeResult<Value> {
        let mut req = self.client.post(url).json(&payload);
        if authed {
            req = req.timeout(Duration::from_secs(30));
            for (name, value) in self.auth_headers() {
                req = req.header(name, value);
            }
        }
        let resp = req.send().await.map_err(ExchangeError::from)?;
        let status = resp.status();
        let body = resp.text().await.map_err(ExchangeError::from)?;
        if !status.is_success() {
            return Err(ExchangeError::from_http_status(status.as_u16(), &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Consistency(format!("grvt {url}: {e}")))
    }
}

/// Extract the `gravity` cookie value and its expiry from a Set-Cookie
/// header like `gravity=abc123; Expires=Wed, 21 Oct 2026 07:28:00 GMT; ...`.
fn parse_gravity_cookie(header: &str) -> Option<(String, Option<DateTime<Utc>>)> {
    let mut gravity = None;
    let mut expires = None;
    for part in header.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("gravity=") {
            gravity = Some(value.to_string());
        } else if let Some(raw) = part
            .strip_prefix("Expires=")
            .or_else(|| part.strip_prefix("expires="))
        {
            let trimmed = raw.trim_end_matches(" GMT");
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%a, %d %b %Y %H:%M:%S") {
                expires = Some(naive.and_utc());
            }
        }
    }
    gravity.map(|g| (g, expires))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_matrix_chain_ids() {
        assert_eq!(GrvtEndpoints::for_env(GrvtEnv::Prod).chain_id, 325);
        assert_eq!(GrvtEndpoints::for_env(GrvtEnv::Testnet).chain_id, 326);
        assert!(GrvtEndpoints::for_env(GrvtEnv::Prod)
            .trade_ws
            .starts_with("wss://trades.grvt.io"));
    }

    #[test]
    fn gravity_cookie_parsed_with_expiry() {
        let header = "gravity=abc123; Path=/; Expires=Wed, 21 Oct 2026 07:28:00 GMT; HttpOnly";
        let (value, expires) = parse_gravity_cookie(header).unwrap();
        assert_eq!(value, "abc123");
        let expires = expires.unwrap();
        assert_eq!(expires.timestamp(), 1792567680);
    }

    #[test]
    fn gravity_cookie_without_expiry_still_parses() {
        let (value, expires) = parse_gravity_cookie("gravity=xyz; Path=/").unwrap();
        assert_eq!(value, "xyz");
        assert!(expires.is_none());
    }

    #[test]
    fn missing_gravity_cookie_rejected() {
        assert!(parse_gravity_cookie("session=other; Path=/").is_none());
    }

    #[test]
    fn unix_ns_round_trip() {
        let now = Utc::now();
        let ns = datetime_to_unix_ns(now);
        let back = unix_ns_to_datetime(&ns);
        assert_eq!(back.timestamp(), now.timestamp());
    }
}
