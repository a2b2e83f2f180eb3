// =============================================================================
// GRVT REST Client — POST-only market and trade endpoints
// =============================================================================
//
// Market-data paths need no auth; trade paths run through the session's
// cookie + account-id headers. Order creation signs an EIP-712 payload
// built from cached instrument metadata (asset hash + base decimals).
// =============================================================================

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tracing::debug;

use crate::adapters::grvt::session::{datetime_to_unix_ns, GrvtSession};
use crate::adapters::grvt::sign::{
    generate_nonce, sign_order, time_in_force_code, time_in_force_for, OrderToSign, SignedLeg,
};
use crate::adapters::OrderRequest;
use crate::error::{ExchangeError, ExchangeResult};
use crate::symbol::decimals_from_step;
use crate::types::{
    Balance, BookLevel, Candle, InstrumentMeta, OrderBookTop, OrderSide, OrderState, OrderStatus,
    OrderType, Position, TickerSnapshot, TradePrint,
};

/// The ticker reports the 8-hour funding rate in basis points; we normalize
/// to a fraction. Venue docs should be re-verified if combined-opportunity
/// scores ever look off by orders of magnitude.
const FUNDING_RATE_DIVISOR: f64 = 10_000.0;

/// Signed orders expire five minutes after creation.
const ORDER_EXPIRY_MINUTES: i64 = 5;

pub struct GrvtRest {
    session: Arc<GrvtSession>,
    private_key: String,
}

impl GrvtRest {
    pub fn new(session: Arc<GrvtSession>, private_key: String) -> Self {
        Self {
            session,
            private_key,
        }
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// Active perpetual instruments with their signing metadata.
    pub async fn get_instruments(&self) -> ExchangeResult<Vec<InstrumentMeta>> {
        let v = self
            .session
            .post_market(
                "full/v1/instruments",
                json!({ "kind": ["PERPETUAL"], "is_active": true }),
            )
            .await?;
        let rows = v
            .get("result")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(instrument) = row.get("instrument").and_then(|s| s.as_str()) else {
                continue;
            };
            let tick = row
                .get("tick_size")
                .and_then(|s| s.as_str())
                .unwrap_or("0.000000001");
            let min_size: f64 = row
                .get("min_size")
                .and_then(|s| s.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            let base_decimals = row
                .get("base_decimals")
                .and_then(|d| d.as_u64())
                .unwrap_or(0) as u32;

            out.push(InstrumentMeta {
                symbol: instrument.to_string(),
                tick_size: tick.parse().unwrap_or(1e-9),
                step_size: min_size.max(1e-9),
                min_quantity: min_size,
                price_decimals: decimals_from_step(tick),
                quantity_decimals: decimals_from_step(&min_size.max(1e-9).to_string()),
                base_decimals,
                instrument_hash: row
                    .get("instrument_hash")
                    .and_then(|h| h.as_str())
                    .map(String::from),
                contract_multiplier: 1.0,
            });
        }
        Ok(out)
    }

    pub async fn get_ticker(&self, native_symbol: &str) -> ExchangeResult<TickerSnapshot> {
        let v = self
            .session
            .post_market("full/v1/ticker", json!({ "instrument": native_symbol }))
            .await?;
        let result = v.get("result").cloned().unwrap_or(Value::Null);
        Ok(parse_ticker(native_symbol, &result))
    }

    pub async fn get_book(
        &self,
        native_symbol: &str,
        depth: u32,
    ) -> ExchangeResult<OrderBookTop> {
        let v = self
            .session
            .post_market(
                "full/v1/book",
                json!({ "instrument": native_symbol, "depth": depth }),
            )
            .await?;
        let result = v.get("result").cloned().unwrap_or(Value::Null);
        Ok(parse_book(native_symbol, &result))
    }

    pub async fn get_candles(
        &self,
        native_symbol: &str,
        interval: &str,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<Candle>> {
        let v = self
            .session
            .post_market(
                "full/v1/kline",
                json!({
                    "instrument": native_symbol,
                    "interval": grvt_interval(interval)?,
                    "limit": limit.unwrap_or(100),
                }),
            )
            .await?;
        let rows = v
            .get("result")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(rows.iter().map(parse_candle).collect())
    }

    pub async fn get_trades(
        &self,
        native_symbol: &str,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<TradePrint>> {
        let v = self
            .session
            .post_market(
                "full/v1/trade",
                json!({ "instrument": native_symbol, "limit": limit.unwrap_or(100) }),
            )
            .await?;
        let rows = v
            .get("result")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|t| parse_trade(native_symbol, t))
            .collect())
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    pub async fn get_balances(&self) -> ExchangeResult<Vec<Balance>> {
        let v = self
            .session
            .post_trade(
                "full/v1/account_summary",
                json!({ "sub_account_id": self.session.sub_account_id }),
            )
            .await?;
        let result = v.get("result").cloned().unwrap_or(Value::Null);
        let rows = result
            .get("spot_balances")
            .and_then(|b| b.as_array())
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for row in &rows {
            let Some(currency) = row.get("currency").and_then(|c| c.as_str()) else {
                continue;
            };
            // Unified account: one total figure; free/used are not broken out.
            let total = str_num(row, "balance").unwrap_or(0.0);
            if total != 0.0 {
                out.push(Balance {
                    currency: currency.to_string(),
                    free: total,
                    used: 0.0,
                    total,
                    usd_value: str_num(row, "index_price")
                        .map(|px| px * total),
                });
            }
        }
        Ok(out)
    }

    pub async fn get_positions(&self) -> ExchangeResult<Vec<Position>> {
        let v = self
            .session
            .post_trade(
                "full/v1/positions",
                json!({ "sub_account_id": self.session.sub_account_id, "kind": ["PERPETUAL"] }),
            )
            .await?;
        let rows = v
            .get("result")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(rows.iter().filter_map(parse_position).collect())
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Build, sign, and submit one order. `meta` must carry the instrument
    /// hash and base decimals cached at connect time.
    pub async fn create_order(
        &self,
        native_symbol: &str,
        meta: &InstrumentMeta,
        request: &OrderRequest,
        client_order_id: &str,
    ) -> ExchangeResult<OrderState> {
        let instrument_hash = meta.instrument_hash.as_deref().ok_or_else(|| {
            ExchangeError::Consistency(format!("grvt: no instrument hash for {native_symbol}"))
        })?;

        let is_market = request.order_type == OrderType::Market;
        let tif = time_in_force_for(request.order_type);
        let leg = SignedLeg::scale(
            instrument_hash,
            request.amount,
            if is_market { None } else { request.price },
            meta.base_decimals,
            request.side == OrderSide::Buy,
        )?;

        let expiration_dt = Utc::now() + ChronoDuration::minutes(ORDER_EXPIRY_MINUTES);
        let to_sign = OrderToSign {
            sub_account_id: self
                .session
                .sub_account_id
                .parse()
                .map_err(|_| ExchangeError::Auth("grvt: sub_account_id is not numeric".into()))?,
            is_market,
            time_in_force: time_in_force_code(tif)?,
            post_only: request.post_only,
            reduce_only: request.reduce_only,
            legs: vec![leg],
            nonce: generate_nonce(),
            expiration: datetime_to_unix_ns(expiration_dt)
                .parse()
                .unwrap_or_default(),
        };
        let signature = sign_order(&self.private_key, self.session.chain_id(), &to_sign)?;

        let payload = json!({
            "order": {
                "sub_account_id": self.session.sub_account_id,
                "is_market": is_market,
                "time_in_force": tif,
                "post_only": request.post_only,
                "reduce_only": request.reduce_only,
                "legs": [{
                    "instrument": native_symbol,
                    "size": request.amount.to_string(),
                    "limit_price": request.price.unwrap_or(0.0).to_string(),
                    "is_buying_asset": request.side == OrderSide::Buy,
                }],
                "signature": {
                    "r": signature.r,
                    "s": signature.s,
                    "v": signature.v,
                    "signer": signature.signer,
                    "nonce": signature.nonce,
                    "expiration": signature.expiration,
                    "chain_id": signature.chain_id,
                },
                "metadata": { "client_order_id": client_order_id },
            }
        });

        debug!(symbol = native_symbol, is_market, "grvt order signed");
        let v = self.session.post_trade("full/v1/create_order", payload).await?;
        let result = v.get("result").cloned().unwrap_or(Value::Null);
        parse_order(&result)
            .ok_or_else(|| ExchangeError::Consistency("grvt: unparseable order response".into()))
    }

    pub async fn cancel_order(&self, order_id: &str) -> ExchangeResult<OrderState> {
        let v = self
            .session
            .post_trade(
                "full/v1/cancel_order",
                json!({
                    "sub_account_id": self.session.sub_account_id,
                    "order_id": order_id,
                }),
            )
            .await?;
        let result = v.get("result").cloned().unwrap_or(Value::Null);
        parse_order(&result)
            .ok_or_else(|| ExchangeError::NotFound(format!("grvt: order {order_id}")))
    }

    /// Native cancel-all acknowledges only a count; the adapter layer falls
    /// back to list-and-cancel when the canceled orders are needed.
    pub async fn cancel_all(&self) -> ExchangeResult<u64> {
        let v = self
            .session
            .post_trade(
                "full/v1/cancel_all_orders",
                json!({ "sub_account_id": self.session.sub_account_id }),
            )
            .await?;
        Ok(v.pointer("/result/num_cancelled")
            .and_then(|n| n.as_u64())
            .unwrap_or(0))
    }

    pub async fn get_order(&self, order_id: &str) -> ExchangeResult<OrderState> {
        let v = self
            .session
            .post_trade(
                "full/v1/order",
                json!({
                    "sub_account_id": self.session.sub_account_id,
                    "order_id": order_id,
                }),
            )
            .await?;
        let result = v.get("result").cloned().unwrap_or(Value::Null);
        parse_order(&result)
            .ok_or_else(|| ExchangeError::NotFound(format!("grvt: order {order_id}")))
    }

    pub async fn get_open_orders(
        &self,
        native_symbol: Option<&str>,
    ) -> ExchangeResult<Vec<OrderState>> {
        let mut payload = json!({
            "sub_account_id": self.session.sub_account_id,
            "kind": ["PERPETUAL"],
        });
        if let Some(sym) = native_symbol {
            payload["instrument"] = json!(sym);
        }
        let v = self.session.post_trade("full/v1/open_orders", payload).await?;
        let rows = v
            .get("result")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(rows.iter().filter_map(parse_order).collect())
    }

    pub async fn get_order_history(
        &self,
        native_symbol: Option<&str>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<OrderState>> {
        let mut payload = json!({
            "sub_account_id": self.session.sub_account_id,
            "limit": limit.unwrap_or(100),
        });
        if let Some(sym) = native_symbol {
            payload["instrument"] = json!(sym);
        }
        let v = self
            .session
            .post_trade("full/v1/order_history", payload)
            .await?;
        let rows = v
            .get("result")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(rows.iter().filter_map(parse_order).collect())
    }
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

fn grvt_interval(timeframe: &str) -> ExchangeResult<&'static str> {
    Ok(match timeframe {
        "1m" => "CI_1_M",
        "5m" => "CI_5_M",
        "15m" => "CI_15_M",
        "30m" => "CI_30_M",
        "1h" => "CI_1_H",
        "4h" => "CI_4_H",
        "1d" => "CI_1_D",
        other => {
            return Err(ExchangeError::Consistency(format!(
                "grvt: unsupported timeframe {other}"
            )))
        }
    })
}

pub fn parse_ticker(native_symbol: &str, v: &Value) -> TickerSnapshot {
    TickerSnapshot {
        symbol: native_symbol.to_string(),
        bid: str_num(v, "best_bid_price"),
        ask: str_num(v, "best_ask_price"),
        bid_size: str_num(v, "best_bid_size"),
        ask_size: str_num(v, "best_ask_size"),
        last: str_num(v, "last_price"),
        mark: str_num(v, "mark_price"),
        index: str_num(v, "index_price"),
        funding_rate: str_num(v, "funding_rate_8h_curr").map(|r| r / FUNDING_RATE_DIVISOR),
        event_time: Some(Utc::now()),
    }
}

pub fn parse_book(native_symbol: &str, v: &Value) -> OrderBookTop {
    let level = |side: &str| -> Option<BookLevel> {
        let row = v.get(side)?.as_array()?.first()?;
        Some(BookLevel {
            price: str_num(row, "price")?,
            size: str_num(row, "size"),
        })
    };
    OrderBookTop {
        symbol: native_symbol.to_string(),
        best_bid: level("bids"),
        best_ask: level("asks"),
        event_time: Some(Utc::now()),
    }
}

fn parse_candle(v: &Value) -> Candle {
    Candle {
        open_time: v
            .get("start_time")
            .and_then(|t| t.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        open: str_num(v, "open").unwrap_or(0.0),
        high: str_num(v, "high").unwrap_or(0.0),
        low: str_num(v, "low").unwrap_or(0.0),
        close: str_num(v, "close").unwrap_or(0.0),
        volume: str_num(v, "volume_b").unwrap_or(0.0),
    }
}

fn parse_trade(native_symbol: &str, v: &Value) -> Option<TradePrint> {
    Some(TradePrint {
        symbol: native_symbol.to_string(),
        price: str_num(v, "price")?,
        size: str_num(v, "size").unwrap_or(0.0),
        side: if v.get("is_taker_buyer").and_then(|b| b.as_bool()).unwrap_or(true) {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        },
        event_time: Some(Utc::now()),
    })
}

fn parse_position(v: &Value) -> Option<Position> {
    let net = str_num(v, "size")?;
    let (side, size) = Position::from_net_quantity(net)?;
    Some(Position {
        symbol: v.get("instrument")?.as_str()?.to_string(),
        side,
        size,
        entry_price: str_num(v, "entry_price").unwrap_or(0.0),
        mark_price: str_num(v, "mark_price"),
        unrealized_pnl: str_num(v, "unrealized_pnl").unwrap_or(0.0),
        realized_pnl: str_num(v, "realized_pnl").unwrap_or(0.0),
        leverage: str_num(v, "leverage").unwrap_or(0.0),
        margin_mode: crate::types::MarginMode::Cross,
        liquidation_price: str_num(v, "est_liquidation_price"),
    })
}

/// Decode a GRVT order object (REST result or WebSocket feed payload).
pub fn parse_order(v: &Value) -> Option<OrderState> {
    let legs = v.get("legs")?.as_array()?;
    let leg = legs.first()?;

    let state = v.get("state").cloned().unwrap_or(Value::Null);
    let status_str = state
        .get("status")
        .and_then(|s| s.as_str())
        .unwrap_or("UNKNOWN");
    let status = match status_str {
        "PENDING" => OrderStatus::Pending,
        "OPEN" => OrderStatus::Open,
        "FILLED" => OrderStatus::Filled,
        "CANCELLED" | "CANCELED" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" => OrderStatus::Expired,
        _ => OrderStatus::Unknown,
    };

    let amount = str_num(leg, "size").unwrap_or(0.0);
    // traded/book sizes are per-leg arrays on the state object.
    let filled = state
        .get("traded_size")
        .and_then(|t| t.as_array())
        .and_then(|a| a.first())
        .and_then(|x| {
            x.as_f64()
                .or_else(|| x.as_str().and_then(|s| s.parse().ok()))
        })
        .unwrap_or(0.0);
    let filled = if status == OrderStatus::Filled && filled == 0.0 {
        amount
    } else {
        filled
    };

    let status = if status == OrderStatus::Open && filled > 0.0 && filled < amount {
        OrderStatus::PartiallyFilled
    } else {
        status
    };

    Some(OrderState {
        order_id: v
            .get("order_id")
            .and_then(|i| i.as_str())
            .unwrap_or("pending")
            .to_string(),
        client_id: v
            .pointer("/metadata/client_order_id")
            .and_then(|c| c.as_str())
            .map(String::from),
        symbol: leg.get("instrument")?.as_str()?.to_string(),
        side: if leg
            .get("is_buying_asset")
            .and_then(|b| b.as_bool())
            .unwrap_or(true)
        {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        },
        order_type: if v.get("is_market").and_then(|b| b.as_bool()).unwrap_or(false) {
            OrderType::Market
        } else {
            match v.get("time_in_force").and_then(|t| t.as_str()) {
                Some("IMMEDIATE_OR_CANCEL") => OrderType::Ioc,
                Some("FILL_OR_KILL") => OrderType::Fok,
                _ => OrderType::Limit,
            }
        },
        amount,
        price: str_num(leg, "limit_price").filter(|p| *p > 0.0),
        filled,
        remaining: (amount - filled).max(0.0),
        average: str_num(&state, "avg_fill_price"),
        status,
        created_at: Utc::now(),
        updated_at: None,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn funding_rate_is_normalized_from_bps() {
        let v = json!({
            "best_bid_price": "64000.1",
            "best_ask_price": "64000.5",
            "funding_rate_8h_curr": "1.25",
        });
        let t = parse_ticker("BTC_USDT_Perp", &v);
        assert!((t.funding_rate.unwrap() - 0.000125).abs() < 1e-12);
        assert!((t.bid.unwrap() - 64000.1).abs() < f64::EPSILON);
    }

    #[test]
    fn book_levels_parse_price_and_size() {
        let v = json!({
            "bids": [{ "price": "99.5", "size": "3.0" }],
            "asks": [{ "price": "100.5", "size": "2.0" }],
        });
        let book = parse_book("ETH_USDT_Perp", &v);
        assert!((book.best_bid.unwrap().price - 99.5).abs() < f64::EPSILON);
        assert_eq!(book.best_ask.unwrap().size, Some(2.0));
        assert!(!book.is_crossed());
    }

    #[test]
    fn order_parse_maps_states_and_fills() {
        let v = json!({
            "order_id": "0xabc",
            "is_market": false,
            "time_in_force": "IMMEDIATE_OR_CANCEL",
            "legs": [{
                "instrument": "BTC_USDT_Perp",
                "size": "1.0",
                "limit_price": "64000",
                "is_buying_asset": false,
            }],
            "state": {
                "status": "OPEN",
                "traded_size": ["0.4"],
                "avg_fill_price": "63999.5",
            },
            "metadata": { "client_order_id": "9991" },
        });
        let order = parse_order(&v).unwrap();
        assert_eq!(order.order_id, "0xabc");
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.order_type, OrderType::Ioc);
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert!((order.filled - 0.4).abs() < f64::EPSILON);
        assert!((order.remaining - 0.6).abs() < f64::EPSILON);
        assert_eq!(order.client_id.as_deref(), Some("9991"));
        assert!(order.quantity_consistent());
    }

    #[test]
    fn filled_status_backfills_traded_size() {
        let v = json!({
            "order_id": "0xdef",
            "is_market": true,
            "legs": [{ "instrument": "ETH_USDT_Perp", "size": "2.0", "is_buying_asset": true }],
            "state": { "status": "FILLED" },
        });
        let order = parse_order(&v).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!((order.filled - 2.0).abs() < f64::EPSILON);
        assert!(order.remaining <= crate::types::QTY_EPSILON);
    }

    #[test]
    fn zero_size_positions_suppressed() {
        let flat = json!({ "instrument": "BTC_USDT_Perp", "size": "0" });
        assert!(parse_position(&flat).is_none());
        let short = json!({ "instrument": "BTC_USDT_Perp", "size": "-1.5", "entry_price": "64000" });
        let p = parse_position(&short).unwrap();
        assert_eq!(p.side, crate::types::PositionSide::Short);
        assert!((p.size - 1.5).abs() < f64::EPSILON);
    }
}
