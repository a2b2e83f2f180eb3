// =============================================================================
// Backpack REST API Client — ED25519-signed requests
// =============================================================================
//
// SECURITY: The private key is never logged or serialized. Every signed
// request carries four headers (X-API-KEY, X-SIGNATURE, X-TIMESTAMP,
// X-WINDOW) over a canonical string
//
//   instruction=<op>&<sorted query/body pairs>&timestamp=<ms>&window=5000
//
// with booleans serialized lowercase. The instruction is a fixed lookup
// from (method, path). Some order endpoints return plain text for terminal
// statuses ("New", "Filled"); those responses are tolerated and a minimal
// order object is synthesized.
// =============================================================================

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{ExchangeError, ExchangeResult};
use crate::symbol::{decimals_from_step, BackpackSymbols};
use crate::types::{
    Balance, BookLevel, Candle, InstrumentMeta, OrderBookTop, OrderSide, OrderState, OrderStatus,
    OrderType, Position, TickerSnapshot, TradePrint,
};

const MAINNET_URL: &str = "https://api.backpack.exchange";
const SIGNING_WINDOW_MS: u64 = 5000;

/// Backpack REST client with ED25519 request signing.
pub struct BackpackRest {
    api_key: String,
    signing_key: Option<SigningKey>,
    base_url: String,
    client: reqwest::Client,
}

impl BackpackRest {
    /// Create a new client. `api_secret` is the base64-encoded private key;
    /// when the decoded bytes are not exactly 32, a SHA-256 digest derives
    /// the seed.
    pub fn new(api_key: impl Into<String>, api_secret: &str, _testnet: bool) -> Self {
        let signing_key = Self::decode_signing_key(api_secret);
        if signing_key.is_none() && !api_secret.is_empty() {
            warn!("backpack: api_secret is not valid base64 — private calls disabled");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            signing_key,
            base_url: MAINNET_URL.to_string(),
            client,
        }
    }

    fn decode_signing_key(api_secret: &str) -> Option<SigningKey> {
        if api_secret.is_empty() {
            return None;
        }
        let mut bytes = B64.decode(api_secret).ok()?;
        if bytes.len() != 32 {
            bytes = Sha256::digest(&bytes).to_vec();
        }
        let seed: [u8; 32] = bytes.try_into().ok()?;
        Some(SigningKey::from_bytes(&seed))
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// Instruction name for a `(method, path)` pair. Unknown endpoints get a
    /// derived fallback so the failure is visible at the venue, not here.
    fn instruction_for(method: &str, path: &str) -> String {
        let method = method.to_uppercase();
        match (method.as_str(), path) {
            ("GET", "/api/v1/account") => "accountQuery".into(),
            ("GET", "/api/v1/capital") => "balanceQuery".into(),
            ("GET", "/api/v1/capital/collateral") => "collateralQuery".into(),
            ("GET", "/api/v1/position") => "positionQuery".into(),
            ("GET", "/api/v1/orders") => "orderQueryAll".into(),
            ("DELETE", "/api/v1/orders") => "orderCancelAll".into(),
            ("POST", "/api/v1/order") => "orderExecute".into(),
            ("DELETE", "/api/v1/order") => "orderCancel".into(),
            ("GET", "/api/v1/order") => "orderQuery".into(),
            ("GET", "/api/v1/ticker") => "marketdataQuery".into(),
            ("GET", "/wapi/v1/history/orders") => "orderHistoryQueryAll".into(),
            ("GET", "/wapi/v1/history/fills") => "fillHistoryQueryAll".into(),
            _ => {
                warn!(method = %method, path, "backpack: unknown endpoint, deriving instruction");
                format!("{}{}", method.to_lowercase(), path.replace('/', "_"))
            }
        }
    }

    /// Canonical signing string. Pairs are merged and sorted by key;
    /// booleans must already be serialized lowercase by the caller
    /// (`pairs_from_value` does this).
    fn canonical_string(
        instruction: &str,
        pairs: &BTreeMap<String, String>,
        timestamp: u64,
        window: u64,
    ) -> String {
        let mut s = format!("instruction={instruction}");
        for (k, v) in pairs {
            s.push_str(&format!("&{k}={v}"));
        }
        s.push_str(&format!("&timestamp={timestamp}&window={window}"));
        s
    }

    /// Flatten a JSON object into sorted signing pairs. Null fields are
    /// skipped; booleans render lowercase.
    fn pairs_from_value(value: &Value) -> BTreeMap<String, String> {
        let mut pairs = BTreeMap::new();
        if let Some(map) = value.as_object() {
            for (k, v) in map {
                let rendered = match v {
                    Value::Null => continue,
                    Value::Bool(b) => b.to_string(),
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                pairs.insert(k.clone(), rendered);
            }
        }
        pairs
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Produce the four signed headers for a request. Deterministic given
    /// `(instruction, pairs, timestamp)`.
    fn signed_headers(
        &self,
        instruction: &str,
        pairs: &BTreeMap<String, String>,
        timestamp: u64,
    ) -> ExchangeResult<Vec<(&'static str, String)>> {
        let key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| ExchangeError::Auth("backpack: no signing key configured".into()))?;

        let message = Self::canonical_string(instruction, pairs, timestamp, SIGNING_WINDOW_MS);
        debug!(canonical = %message, "backpack signing string");
        let signature = key.sign(message.as_bytes());

        Ok(vec![
            ("X-API-KEY", self.api_key.clone()),
            ("X-SIGNATURE", B64.encode(signature.to_bytes())),
            ("X-TIMESTAMP", timestamp.to_string()),
            ("X-WINDOW", SIGNING_WINDOW_MS.to_string()),
        ])
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn public_get(&self, path: &str, query: &[(&str, String)]) -> ExchangeResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(ExchangeError::from)?;

        let status = resp.status();
        let body = resp.text().await.map_err(ExchangeError::from)?;
        if !status.is_success() {
            return Err(ExchangeError::from_http_status(status.as_u16(), &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Consistency(format!("backpack {path}: {e}")))
    }

    /// Signed request. GET/DELETE-with-body/POST all run through here; the
    /// response may be JSON or a bare status string.
    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        payload: Value,
    ) -> ExchangeResult<Value> {
        let instruction = Self::instruction_for(method.as_str(), path);
        let pairs = Self::pairs_from_value(&payload);
        let timestamp = Self::timestamp_ms();
        let headers = self.signed_headers(&instruction, &pairs, timestamp)?;

        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .request(method.clone(), &url)
            .timeout(Duration::from_secs(30));
        for (name, value) in headers {
            req = req.header(name, value);
        }
        req = if method == reqwest::Method::GET {
            let query: Vec<(String, String)> = pairs.into_iter().collect();
            req.query(&query)
        } else {
            req.json(&payload)
        };

        let resp = req.send().await.map_err(ExchangeError::from)?;
        let status = resp.status();
        let body = resp.text().await.map_err(ExchangeError::from)?;
        if !status.is_success() {
            return Err(ExchangeError::from_http_status(status.as_u16(), &body));
        }

        // Terminal order statuses may come back as bare text ("New",
        // "Filled"). Fold those into a status-only JSON value.
        match serde_json::from_str(&body) {
            Ok(v) => Ok(v),
            Err(_) => {
                let text = body.trim().trim_matches('"').to_string();
                debug!(response = %text, "backpack returned plain-text response");
                Ok(json!({ "status": text }))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// Fetch perp markets and parse their filters into typed instrument
    /// descriptors, keyed by canonical symbol.
    pub async fn get_instruments(&self) -> ExchangeResult<Vec<(String, InstrumentMeta)>> {
        let markets = self.public_get("/api/v1/markets", &[]).await?;
        let list = markets
            .as_array()
            .ok_or_else(|| ExchangeError::Consistency("backpack markets: not an array".into()))?;

        let mut out = Vec::new();
        for market in list {
            let Some(native) = market.get("symbol").and_then(|s| s.as_str()) else {
                continue;
            };
            if !native.ends_with("_PERP") {
                continue; // spot markets are out of universe here
            }
            let Ok(canonical) = BackpackSymbols::normalize(native) else {
                continue;
            };

            let filters = market.get("filters").cloned().unwrap_or(Value::Null);
            let tick = filters
                .pointer("/price/tickSize")
                .and_then(|v| v.as_str())
                .unwrap_or("0.00000001");
            let step = filters
                .pointer("/quantity/stepSize")
                .and_then(|v| v.as_str())
                .unwrap_or("0.00000001");
            let min_qty = filters
                .pointer("/quantity/minQuantity")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);

            out.push((
                canonical,
                InstrumentMeta {
                    symbol: native.to_string(),
                    tick_size: tick.parse().unwrap_or(1e-8),
                    step_size: step.parse().unwrap_or(1e-8),
                    min_quantity: min_qty,
                    price_decimals: decimals_from_step(tick),
                    quantity_decimals: decimals_from_step(step),
                    base_decimals: 0,
                    instrument_hash: None,
                    contract_multiplier: 1.0,
                },
            ));
        }
        Ok(out)
    }

    pub async fn get_ticker(&self, native_symbol: &str) -> ExchangeResult<TickerSnapshot> {
        let v = self
            .public_get("/api/v1/ticker", &[("symbol", native_symbol.to_string())])
            .await?;
        Ok(parse_ticker(native_symbol, &v))
    }

    pub async fn get_depth(&self, native_symbol: &str) -> ExchangeResult<OrderBookTop> {
        let v = self
            .public_get("/api/v1/depth", &[("symbol", native_symbol.to_string())])
            .await?;
        parse_depth(native_symbol, &v)
    }

    pub async fn get_klines(
        &self,
        native_symbol: &str,
        interval: &str,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<Candle>> {
        let mut query = vec![
            ("symbol", native_symbol.to_string()),
            ("interval", interval.to_string()),
        ];
        if let Some(n) = limit {
            query.push(("limit", n.to_string()));
        }
        let v = self.public_get("/api/v1/klines", &query).await?;
        let rows = v.as_array().cloned().unwrap_or_default();
        Ok(rows.iter().filter_map(parse_candle).collect())
    }

    pub async fn get_recent_trades(
        &self,
        native_symbol: &str,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<TradePrint>> {
        let mut query = vec![("symbol", native_symbol.to_string())];
        if let Some(n) = limit {
            query.push(("limit", n.to_string()));
        }
        let v = self.public_get("/api/v1/trades", &query).await?;
        let rows = v.as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|t| parse_trade(native_symbol, t))
            .collect())
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    /// Balances from `/api/v1/capital`. The unified account reports
    /// `totalQuantity` as the authoritative figure.
    pub async fn get_balances(&self) -> ExchangeResult<Vec<Balance>> {
        let v = self
            .signed_request(reqwest::Method::GET, "/api/v1/capital", json!({}))
            .await?;
        let mut out = Vec::new();
        if let Some(map) = v.as_object() {
            for (currency, fields) in map {
                let free = num_field(fields, "available");
                let used = num_field(fields, "locked");
                let total = {
                    let t = num_field(fields, "totalQuantity");
                    if t > 0.0 {
                        t
                    } else {
                        free + used
                    }
                };
                if total > 0.0 || free > 0.0 {
                    out.push(Balance {
                        currency: currency.clone(),
                        free,
                        used,
                        total,
                        usd_value: None,
                    });
                }
            }
        }
        Ok(out)
    }

    pub async fn get_positions(&self) -> ExchangeResult<Vec<Position>> {
        let v = self
            .signed_request(reqwest::Method::GET, "/api/v1/position", json!({}))
            .await?;
        let rows = v.as_array().cloned().unwrap_or_default();
        Ok(rows.iter().filter_map(parse_position).collect())
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    pub async fn execute_order(
        &self,
        native_symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: &str,
        price: Option<&str>,
        reduce_only: bool,
        post_only: bool,
        client_id: Option<u32>,
    ) -> ExchangeResult<OrderState> {
        let mut payload = json!({
            "symbol": native_symbol,
            "side": match side { OrderSide::Buy => "Bid", OrderSide::Sell => "Ask" },
            "orderType": match order_type {
                OrderType::Market => "Market",
                _ => "Limit",
            },
            "quantity": quantity,
        });
        let obj = payload.as_object_mut().expect("payload is an object");
        if let Some(p) = price {
            obj.insert("price".into(), json!(p));
        }
        match order_type {
            OrderType::Ioc => {
                obj.insert("timeInForce".into(), json!("IOC"));
            }
            OrderType::Fok => {
                obj.insert("timeInForce".into(), json!("FOK"));
            }
            _ => {}
        }
        if reduce_only {
            obj.insert("reduceOnly".into(), json!(true));
        }
        if post_only {
            obj.insert("postOnly".into(), json!(true));
        }
        if let Some(id) = client_id {
            obj.insert("clientId".into(), json!(id));
        }

        let v = self
            .signed_request(reqwest::Method::POST, "/api/v1/order", payload)
            .await?;
        Ok(parse_order(native_symbol, &v))
    }

    pub async fn cancel_order(
        &self,
        order_id: &str,
        native_symbol: &str,
    ) -> ExchangeResult<OrderState> {
        let payload = json!({ "symbol": native_symbol, "orderId": order_id });
        let v = self
            .signed_request(reqwest::Method::DELETE, "/api/v1/order", payload)
            .await?;
        Ok(parse_order(native_symbol, &v))
    }

    /// Native cancel-all returns the canceled orders directly.
    pub async fn cancel_all(&self, native_symbol: &str) -> ExchangeResult<Vec<OrderState>> {
        let payload = json!({ "symbol": native_symbol });
        let v = self
            .signed_request(reqwest::Method::DELETE, "/api/v1/orders", payload)
            .await?;
        let rows = v.as_array().cloned().unwrap_or_default();
        Ok(rows.iter().map(|o| parse_order(native_symbol, o)).collect())
    }

    pub async fn get_order(
        &self,
        order_id: &str,
        native_symbol: &str,
    ) -> ExchangeResult<OrderState> {
        let payload = json!({ "symbol": native_symbol, "orderId": order_id });
        let v = self
            .signed_request(reqwest::Method::GET, "/api/v1/order", payload)
            .await?;
        Ok(parse_order(native_symbol, &v))
    }

    pub async fn get_open_orders(
        &self,
        native_symbol: Option<&str>,
    ) -> ExchangeResult<Vec<OrderState>> {
        let payload = match native_symbol {
            Some(s) => json!({ "symbol": s }),
            None => json!({}),
        };
        let v = self
            .signed_request(reqwest::Method::GET, "/api/v1/orders", payload)
            .await?;
        let rows = v.as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .map(|o| {
                let sym = o.get("symbol").and_then(|s| s.as_str()).unwrap_or("");
                parse_order(sym, o)
            })
            .collect())
    }

    pub async fn get_order_history(
        &self,
        native_symbol: Option<&str>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<OrderState>> {
        let mut payload = serde_json::Map::new();
        if let Some(s) = native_symbol {
            payload.insert("symbol".into(), json!(s));
        }
        if let Some(n) = limit {
            payload.insert("limit".into(), json!(n.to_string()));
        }
        let v = self
            .signed_request(
                reqwest::Method::GET,
                "/wapi/v1/history/orders",
                Value::Object(payload),
            )
            .await?;
        let rows = v.as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .map(|o| {
                let sym = o.get("symbol").and_then(|s| s.as_str()).unwrap_or("");
                parse_order(sym, o)
            })
            .collect())
    }

    pub async fn ping(&self) -> ExchangeResult<()> {
        self.public_get("/api/v1/status", &[]).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

fn num_field(v: &Value, key: &str) -> f64 {
    v.get(key)
        .and_then(|x| {
            x.as_f64()
                .or_else(|| x.as_str().and_then(|s| s.parse().ok()))
        })
        .unwrap_or(0.0)
}

fn opt_num_field(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(|x| {
        x.as_f64()
            .or_else(|| x.as_str().and_then(|s| s.parse().ok()))
    })
}

fn parse_ticker(native_symbol: &str, v: &Value) -> TickerSnapshot {
    TickerSnapshot {
        symbol: native_symbol.to_string(),
        bid: opt_num_field(v, "bidPrice"),
        ask: opt_num_field(v, "askPrice"),
        bid_size: opt_num_field(v, "bidQty"),
        ask_size: opt_num_field(v, "askQty"),
        last: opt_num_field(v, "lastPrice"),
        mark: opt_num_field(v, "markPrice"),
        index: opt_num_field(v, "indexPrice"),
        funding_rate: opt_num_field(v, "fundingRate"),
        event_time: Some(Utc::now()),
    }
}

fn parse_depth(native_symbol: &str, v: &Value) -> ExchangeResult<OrderBookTop> {
    let level = |side: &str, pick_last: bool| -> Option<BookLevel> {
        let rows = v.get(side)?.as_array()?;
        let row = if pick_last { rows.last() } else { rows.first() }?;
        let price: f64 = row.get(0)?.as_str()?.parse().ok()?;
        let size: Option<f64> = row.get(1).and_then(|s| s.as_str()).and_then(|s| s.parse().ok());
        Some(BookLevel { price, size })
    };

    // Backpack depth lists bids ascending: the best bid is the last row.
    Ok(OrderBookTop {
        symbol: native_symbol.to_string(),
        best_bid: level("bids", true),
        best_ask: level("asks", false),
        event_time: Some(Utc::now()),
    })
}

fn parse_candle(v: &Value) -> Option<Candle> {
    Some(Candle {
        open_time: v.get("start").and_then(|t| t.as_i64()).unwrap_or(0),
        open: num_field(v, "open"),
        high: num_field(v, "high"),
        low: num_field(v, "low"),
        close: num_field(v, "close"),
        volume: num_field(v, "volume"),
    })
}

fn parse_trade(native_symbol: &str, v: &Value) -> Option<TradePrint> {
    Some(TradePrint {
        symbol: native_symbol.to_string(),
        price: opt_num_field(v, "price")?,
        size: num_field(v, "quantity"),
        side: if v.get("isBuyerMaker").and_then(|b| b.as_bool()).unwrap_or(false) {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        },
        event_time: Some(Utc::now()),
    })
}

fn parse_position(v: &Value) -> Option<Position> {
    let net = opt_num_field(v, "netQuantity")?;
    let (side, size) = Position::from_net_quantity(net)?;
    Some(Position {
        symbol: v.get("symbol")?.as_str()?.to_string(),
        side,
        size,
        entry_price: num_field(v, "entryPrice"),
        mark_price: opt_num_field(v, "markPrice"),
        unrealized_pnl: num_field(v, "pnlUnrealized"),
        realized_pnl: num_field(v, "pnlRealized"),
        leverage: num_field(v, "leverage"),
        margin_mode: crate::types::MarginMode::Cross,
        liquidation_price: opt_num_field(v, "estLiquidationPrice"),
    })
}

/// Map a venue order payload (or a bare status string folded into
/// `{"status": ...}`) into an `OrderState`. Status-only responses get the
/// synthetic id "pending".
pub fn parse_order(native_symbol: &str, v: &Value) -> OrderState {
    let status_str = v
        .get("status")
        .and_then(|s| s.as_str())
        .unwrap_or("Unknown");
    let status = match status_str {
        "New" | "Accepted" => OrderStatus::Open,
        "PartiallyFilled" => OrderStatus::PartiallyFilled,
        "Filled" => OrderStatus::Filled,
        "Cancelled" | "Canceled" => OrderStatus::Canceled,
        "Expired" => OrderStatus::Expired,
        "Rejected" => OrderStatus::Rejected,
        "TriggerPending" => OrderStatus::Pending,
        _ => OrderStatus::Unknown,
    };

    let amount = num_field(v, "quantity");
    let filled = num_field(v, "executedQuantity");
    OrderState {
        order_id: v
            .get("id")
            .and_then(|i| i.as_str().map(String::from).or_else(|| i.as_u64().map(|n| n.to_string())))
            .unwrap_or_else(|| "pending".to_string()),
        client_id: v
            .get("clientId")
            .and_then(|i| i.as_u64())
            .map(|n| n.to_string()),
        symbol: v
            .get("symbol")
            .and_then(|s| s.as_str())
            .unwrap_or(native_symbol)
            .to_string(),
        side: match v.get("side").and_then(|s| s.as_str()) {
            Some("Ask") => OrderSide::Sell,
            _ => OrderSide::Buy,
        },
        order_type: match v.get("orderType").and_then(|s| s.as_str()) {
            Some("Market") => OrderType::Market,
            _ => OrderType::Limit,
        },
        amount,
        price: opt_num_field(v, "price"),
        filled,
        remaining: (amount - filled).max(0.0),
        average: opt_num_field(v, "avgFillPrice"),
        status,
        created_at: Utc::now(),
        updated_at: None,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> BackpackRest {
        // 32 zero bytes, base64-encoded: a structurally valid signing seed.
        let seed_b64 = B64.encode([0u8; 32]);
        BackpackRest::new("pubkey", &seed_b64, false)
    }

    #[test]
    fn instruction_lookup_matches_wire_contract() {
        assert_eq!(
            BackpackRest::instruction_for("GET", "/api/v1/capital"),
            "balanceQuery"
        );
        assert_eq!(
            BackpackRest::instruction_for("POST", "/api/v1/order"),
            "orderExecute"
        );
        assert_eq!(
            BackpackRest::instruction_for("DELETE", "/api/v1/orders"),
            "orderCancelAll"
        );
        assert_eq!(
            BackpackRest::instruction_for("GET", "/wapi/v1/history/orders"),
            "orderHistoryQueryAll"
        );
        assert_eq!(
            BackpackRest::instruction_for("GET", "/api/v1/ticker"),
            "marketdataQuery"
        );
    }

    #[test]
    fn canonical_string_sorts_pairs_and_lowercases_bools() {
        let payload = json!({
            "symbol": "BTC_USDC_PERP",
            "reduceOnly": true,
            "quantity": "0.1",
            "price": Value::Null,
        });
        let pairs = BackpackRest::pairs_from_value(&payload);
        let s = BackpackRest::canonical_string("orderExecute", &pairs, 1700000000000, 5000);
        assert_eq!(
            s,
            "instruction=orderExecute&quantity=0.1&reduceOnly=true&symbol=BTC_USDC_PERP\
             &timestamp=1700000000000&window=5000"
        );
    }

    #[test]
    fn signing_is_deterministic() {
        let client = test_client();
        let pairs = BackpackRest::pairs_from_value(&json!({ "symbol": "BTC_USDC_PERP" }));
        let a = client
            .signed_headers("balanceQuery", &pairs, 1700000000000)
            .unwrap();
        let b = client
            .signed_headers("balanceQuery", &pairs, 1700000000000)
            .unwrap();
        assert_eq!(a[1].1, b[1].1, "same input must produce byte-equal signatures");
        assert_eq!(a[3].1, "5000");
    }

    #[test]
    fn non_32_byte_secret_is_sha256_derived() {
        let short = B64.encode(b"short-secret");
        let client = BackpackRest::new("pubkey", &short, false);
        assert!(client.signing_key.is_some());
    }

    #[test]
    fn plain_text_status_synthesizes_minimal_order() {
        let folded = json!({ "status": "New" });
        let order = parse_order("BTC_USDC_PERP", &folded);
        assert_eq!(order.order_id, "pending");
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.symbol, "BTC_USDC_PERP");
    }

    #[test]
    fn order_payload_parses_fills() {
        let v = json!({
            "id": "112233",
            "symbol": "ETH_USDC_PERP",
            "side": "Ask",
            "orderType": "Market",
            "quantity": "2",
            "executedQuantity": "1.5",
            "status": "PartiallyFilled",
            "clientId": 42,
        });
        let order = parse_order("ETH_USDC_PERP", &v);
        assert_eq!(order.order_id, "112233");
        assert_eq!(order.side, OrderSide::Sell);
        assert!((order.filled - 1.5).abs() < f64::EPSILON);
        assert!((order.remaining - 0.5).abs() < f64::EPSILON);
        assert_eq!(order.client_id.as_deref(), Some("42"));
        assert!(order.quantity_consistent());
    }

    #[test]
    fn depth_picks_best_from_sorted_rows() {
        let v = json!({
            "bids": [["99.0", "3"], ["99.5", "2"], ["100.0", "1"]],
            "asks": [["100.5", "4"], ["101.0", "5"]],
        });
        let book = parse_depth("BTC_USDC_PERP", &v).unwrap();
        assert!((book.best_bid.unwrap().price - 100.0).abs() < f64::EPSILON);
        assert!((book.best_ask.unwrap().price - 100.5).abs() < f64::EPSILON);
        assert!(!book.is_crossed());
    }

    #[test]
    fn unified_balance_total_is_authoritative() {
        let v = json!({
            "USDC": { "available": "0", "locked": "0", "totalQuantity": "1500.5" },
        });
        // Simulate the mapping logic inline.
        let total = num_field(&v["USDC"], "totalQuantity");
        assert!((total - 1500.5).abs() < f64::EPSILON);
    }
}
