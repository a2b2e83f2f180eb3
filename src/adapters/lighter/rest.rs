// =============================================================================
// Lighter REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. Signed requests
// carry the API key as a header and a hex HMAC signature over the query
// string, with a timestamp for replay protection.
//
// REST here is the fallback path: normal two-leg execution on this venue
// goes through the WebSocket batch submit, and fills are confirmed by the
// order push stream either way.
// =============================================================================

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::error::{ExchangeError, ExchangeResult};
use crate::types::{
    Balance, BookLevel, Candle, InstrumentMeta, OrderBookTop, OrderSide, OrderState, OrderStatus,
    OrderType, Position, TickerSnapshot, TradePrint,
};

type HmacSha256 = Hmac<Sha256>;

const MAINNET_URL: &str = "https://api.lighter.xyz";
const TESTNET_URL: &str = "https://api.testnet.lighter.xyz";

pub struct LighterRest {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl LighterRest {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: if testnet { TESTNET_URL } else { MAINNET_URL }.to_string(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Hex HMAC-SHA256 signature of `query`. Deterministic per input.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Append timestamp and signature to a query string.
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}")
        } else {
            format!("{params}&timestamp={ts}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn public_get(&self, path: &str, query: &str) -> ExchangeResult<Value> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let resp = self.client.get(&url).send().await.map_err(ExchangeError::from)?;
        let status = resp.status();
        let body = resp.text().await.map_err(ExchangeError::from)?;
        if !status.is_success() {
            return Err(ExchangeError::from_http_status(status.as_u16(), &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Consistency(format!("lighter {path}: {e}")))
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> ExchangeResult<Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let resp = self
            .client
            .request(method, &url)
            .header("X-API-KEY", &self.api_key)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(ExchangeError::from)?;
        let status = resp.status();
        let body = resp.text().await.map_err(ExchangeError::from)?;
        if !status.is_success() {
            return Err(ExchangeError::from_http_status(status.as_u16(), &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Consistency(format!("lighter {path}: {e}")))
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    pub async fn get_markets(&self) -> ExchangeResult<Vec<InstrumentMeta>> {
        let v = self.public_get("/api/v1/orderBooks", "").await?;
        let rows = v
            .get("order_books")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(symbol) = row.get("symbol").and_then(|s| s.as_str()) else {
                continue;
            };
            let price_decimals = row
                .get("supported_price_decimals")
                .and_then(|d| d.as_u64())
                .unwrap_or(8) as u32;
            let size_decimals = row
                .get("supported_size_decimals")
                .and_then(|d| d.as_u64())
                .unwrap_or(8) as u32;
            let min_qty = str_num(row, "min_base_amount").unwrap_or(0.0);
            out.push(InstrumentMeta {
                symbol: symbol.to_string(),
                tick_size: 10f64.powi(-(price_decimals as i32)),
                step_size: 10f64.powi(-(size_decimals as i32)),
                min_quantity: min_qty,
                price_decimals,
                quantity_decimals: size_decimals,
                base_decimals: 0,
                instrument_hash: None,
                contract_multiplier: 1.0,
            });
        }
        Ok(out)
    }

    pub async fn get_ticker(&self, market: &str) -> ExchangeResult<TickerSnapshot> {
        let v = self
            .public_get("/api/v1/marketStats", &format!("market={market}"))
            .await?;
        let stats = v.get("market_stats").cloned().unwrap_or(v);
        Ok(parse_market_stats(market, &stats))
    }

    pub async fn get_book(&self, market: &str) -> ExchangeResult<OrderBookTop> {
        let v = self
            .public_get("/api/v1/orderBookOrders", &format!("market={market}&limit=1"))
            .await?;
        Ok(parse_book(market, &v))
    }

    pub async fn get_candles(
        &self,
        market: &str,
        resolution: &str,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<Candle>> {
        let query = format!(
            "market={market}&resolution={resolution}&limit={}",
            limit.unwrap_or(100)
        );
        let v = self.public_get("/api/v1/candlesticks", &query).await?;
        let rows = v
            .get("candlesticks")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(rows.iter().map(parse_candle).collect())
    }

    pub async fn get_recent_trades(
        &self,
        market: &str,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<TradePrint>> {
        let query = format!("market={market}&limit={}", limit.unwrap_or(100));
        let v = self.public_get("/api/v1/recentTrades", &query).await?;
        let rows = v
            .get("trades")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(rows.iter().filter_map(|t| parse_trade(market, t)).collect())
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    /// Exchange a signed request for a WebSocket auth token.
    pub async fn get_ws_token(&self) -> ExchangeResult<String> {
        let v = self
            .signed_request(reqwest::Method::POST, "/api/v1/auth", "")
            .await?;
        v.get("token")
            .and_then(|t| t.as_str())
            .map(String::from)
            .ok_or_else(|| ExchangeError::Auth("lighter: auth response carried no token".into()))
    }

    pub async fn get_balances(&self) -> ExchangeResult<Vec<Balance>> {
        let v = self
            .signed_request(reqwest::Method::GET, "/api/v1/account", "")
            .await?;
        let mut out = Vec::new();
        let collateral = str_num(&v, "collateral").unwrap_or(0.0);
        let available = str_num(&v, "available_balance").unwrap_or(collateral);
        if collateral > 0.0 || available > 0.0 {
            out.push(Balance {
                currency: "USDC".into(),
                free: available,
                used: (collateral - available).max(0.0),
                total: collateral,
                usd_value: Some(collateral),
            });
        }
        Ok(out)
    }

    pub async fn get_positions(&self) -> ExchangeResult<Vec<Position>> {
        let v = self
            .signed_request(reqwest::Method::GET, "/api/v1/positions", "")
            .await?;
        let rows = v
            .get("positions")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(rows.iter().filter_map(parse_position).collect())
    }

    // -------------------------------------------------------------------------
    // Orders (REST fallback path)
    // -------------------------------------------------------------------------

    pub async fn create_order(
        &self,
        market: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: &str,
        price: Option<&str>,
        reduce_only: bool,
        client_id: &str,
    ) -> ExchangeResult<OrderState> {
        let mut params = format!(
            "market={market}&side={}&type={}&size={quantity}&client_order_id={client_id}",
            match side {
                OrderSide::Buy => "buy",
                OrderSide::Sell => "sell",
            },
            match order_type {
                OrderType::Market => "market",
                OrderType::Ioc => "ioc",
                OrderType::Fok => "fok",
                OrderType::Limit => "limit",
            },
        );
        if let Some(p) = price {
            params.push_str(&format!("&price={p}"));
        }
        if reduce_only {
            params.push_str("&reduce_only=true");
        }

        let v = self
            .signed_request(reqwest::Method::POST, "/api/v1/order", &params)
            .await?;
        let order = v.get("order").cloned().unwrap_or(v);
        parse_order(market, &order)
            .ok_or_else(|| ExchangeError::Consistency("lighter: unparseable order response".into()))
    }

    pub async fn cancel_order(&self, order_id: &str, market: &str) -> ExchangeResult<OrderState> {
        let params = format!("market={market}&order_id={order_id}");
        let v = self
            .signed_request(reqwest::Method::DELETE, "/api/v1/order", &params)
            .await?;
        let order = v.get("order").cloned().unwrap_or(v);
        parse_order(market, &order)
            .ok_or_else(|| ExchangeError::NotFound(format!("lighter: order {order_id}")))
    }

    pub async fn get_order(&self, order_id: &str, market: &str) -> ExchangeResult<OrderState> {
        let params = format!("market={market}&order_id={order_id}");
        let v = self
            .signed_request(reqwest::Method::GET, "/api/v1/order", &params)
            .await?;
        let order = v.get("order").cloned().unwrap_or(v);
        parse_order(market, &order)
            .ok_or_else(|| ExchangeError::NotFound(format!("lighter: order {order_id}")))
    }

    pub async fn get_open_orders(&self, market: Option<&str>) -> ExchangeResult<Vec<OrderState>> {
        let params = market.map(|m| format!("market={m}")).unwrap_or_default();
        let v = self
            .signed_request(reqwest::Method::GET, "/api/v1/orders", &params)
            .await?;
        Ok(order_rows(&v, market))
    }

    pub async fn get_order_history(
        &self,
        market: Option<&str>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<OrderState>> {
        let mut params = format!("limit={}", limit.unwrap_or(100));
        if let Some(m) = market {
            params.push_str(&format!("&market={m}"));
        }
        let v = self
            .signed_request(reqwest::Method::GET, "/api/v1/ordersHistory", &params)
            .await?;
        Ok(order_rows(&v, market))
    }

    pub async fn ping(&self) -> ExchangeResult<()> {
        self.public_get("/api/v1/status", "").await.map(|_| ())
    }
}

fn order_rows(v: &Value, market: Option<&str>) -> Vec<OrderState> {
    v.get("orders")
        .and_then(|r| r.as_array())
        .cloned()
        .unwrap_or_default()
        .iter()
        .filter_map(|o| {
            let m = o
                .get("market")
                .and_then(|s| s.as_str())
                .or(market)
                .unwrap_or("");
            parse_order(m, o)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

fn str_num(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(|x| {
        x.as_f64()
            .or_else(|| x.as_str().and_then(|s| s.parse().ok()))
    })
}

pub fn parse_market_stats(market: &str, v: &Value) -> TickerSnapshot {
    TickerSnapshot {
        symbol: market.to_string(),
        bid: str_num(v, "best_bid"),
        ask: str_num(v, "best_ask"),
        bid_size: None,
        ask_size: None,
        last: str_num(v, "last_trade_price"),
        mark: str_num(v, "mark_price"),
        index: str_num(v, "index_price"),
        funding_rate: str_num(v, "current_funding_rate"),
        event_time: Some(Utc::now()),
    }
}

pub fn parse_book(market: &str, v: &Value) -> OrderBookTop {
    let level = |side: &str| -> Option<BookLevel> {
        let row = v.get(side)?.as_array()?.first()?;
        Some(BookLevel {
            price: str_num(row, "price")?,
            size: str_num(row, "remaining_base_amount").or_else(|| str_num(row, "size")),
        })
    };
    OrderBookTop {
        symbol: market.to_string(),
        best_bid: level("bids"),
        best_ask: level("asks"),
        event_time: Some(Utc::now()),
    }
}

fn parse_candle(v: &Value) -> Candle {
    Candle {
        open_time: v.get("timestamp").and_then(|t| t.as_i64()).unwrap_or(0),
        open: str_num(v, "open").unwrap_or(0.0),
        high: str_num(v, "high").unwrap_or(0.0),
        low: str_num(v, "low").unwrap_or(0.0),
        close: str_num(v, "close").unwrap_or(0.0),
        volume: str_num(v, "volume").unwrap_or(0.0),
    }
}

fn parse_trade(market: &str, v: &Value) -> Option<TradePrint> {
    Some(TradePrint {
        symbol: market.to_string(),
        price: str_num(v, "price")?,
        size: str_num(v, "size").unwrap_or(0.0),
        side: match v.get("side").and_then(|s| s.as_str()) {
            Some("sell") => OrderSide::Sell,
            _ => OrderSide::Buy,
        },
        event_time: Some(Utc::now()),
    })
}

fn parse_position(v: &Value) -> Option<Position> {
    let signed_size = str_num(v, "position")?
        * match v.get("sign").and_then(|s| s.as_i64()) {
            Some(-1) => -1.0,
            _ => 1.0,
        };
    let (side, size) = Position::from_net_quantity(signed_size)?;
    Some(Position {
        symbol: v.get("market")?.as_str()?.to_string(),
        side,
        size,
        entry_price: str_num(v, "avg_entry_price").unwrap_or(0.0),
        mark_price: str_num(v, "mark_price"),
        unrealized_pnl: str_num(v, "unrealized_pnl").unwrap_or(0.0),
        realized_pnl: str_num(v, "realized_pnl").unwrap_or(0.0),
        leverage: str_num(v, "leverage").unwrap_or(0.0),
        margin_mode: crate::types::MarginMode::Cross,
        liquidation_price: str_num(v, "liquidation_price"),
    })
}

/// Decode a lighter order object (REST response or WebSocket push).
pub fn parse_order(market: &str, v: &Value) -> Option<OrderState> {
    let status = match v.get("status").and_then(|s| s.as_str()) {
        Some("pending") => OrderStatus::Pending,
        Some("open") => OrderStatus::Open,
        Some("partially_filled") => OrderStatus::PartiallyFilled,
        Some("filled") => OrderStatus::Filled,
        Some("canceled") | Some("cancelled") => OrderStatus::Canceled,
        Some("rejected") => OrderStatus::Rejected,
        Some("expired") => OrderStatus::Expired,
        _ => OrderStatus::Unknown,
    };
    let amount = str_num(v, "size").or_else(|| str_num(v, "initial_base_amount"))?;
    let filled = str_num(v, "filled_size")
        .or_else(|| str_num(v, "filled_base_amount"))
        .unwrap_or(0.0);

    Some(OrderState {
        order_id: v
            .get("order_id")
            .and_then(|i| {
                i.as_str()
                    .map(String::from)
                    .or_else(|| i.as_u64().map(|n| n.to_string()))
            })
            .unwrap_or_else(|| "pending".to_string()),
        client_id: v.get("client_order_id").and_then(|i| {
            i.as_str()
                .map(String::from)
                .or_else(|| i.as_u64().map(|n| n.to_string()))
        }),
        symbol: v
            .get("market")
            .and_then(|s| s.as_str())
            .unwrap_or(market)
            .to_string(),
        side: match v.get("side").and_then(|s| s.as_str()) {
            Some("sell") => OrderSide::Sell,
            _ => OrderSide::Buy,
        },
        order_type: match v.get("type").and_then(|s| s.as_str()) {
            Some("market") => OrderType::Market,
            Some("ioc") => OrderType::Ioc,
            Some("fok") => OrderType::Fok,
            _ => OrderType::Limit,
        },
        amount,
        price: str_num(v, "price"),
        filled,
        remaining: (amount - filled).max(0.0),
        average: str_num(v, "avg_fill_price"),
        status,
        created_at: Utc::now(),
        updated_at: None,
    })
}
