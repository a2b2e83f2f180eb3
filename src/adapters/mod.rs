// =============================================================================
// Exchange Adapters — uniform contract over heterogeneous venues
// =============================================================================
//
// Every venue exposes the same `ExchangeAdapter` surface regardless of its
// native auth scheme (ED25519 headers, session cookie + account-id header,
// API-key/secret), symbol grammar, or transport quirks. Adding a venue means
// adding a REST client, a WebSocket client, a symbol translator, and a
// wiring module here — the orchestrator, aggregator, and executor never
// change.
// =============================================================================

pub mod backpack;
pub mod grvt;
pub mod lighter;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ExchangeError, ExchangeResult};
use crate::types::{
    Balance, Candle, OrderBookTop, OrderSide, OrderState, OrderType, Position, TickerSnapshot,
    TradePrint,
};

// ---------------------------------------------------------------------------
// Callback types
// ---------------------------------------------------------------------------
//
// One canonical signature per subscription kind: `(snapshot) -> ()`.
// Closures capture whatever context they need.

pub type TickerCallback = Arc<dyn Fn(TickerSnapshot) + Send + Sync>;
pub type BookCallback = Arc<dyn Fn(OrderBookTop) + Send + Sync>;
pub type TradeCallback = Arc<dyn Fn(TradePrint) + Send + Sync>;
pub type OrderCallback = Arc<dyn Fn(OrderState) + Send + Sync>;

// ---------------------------------------------------------------------------
// Request / response shapes
// ---------------------------------------------------------------------------

/// Parameters for a single order submission. `symbol` is canonical; the
/// adapter translates to its native grammar.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub post_only: bool,
    /// Client-generated id for idempotent tracking; the adapter generates
    /// one when absent.
    pub client_id: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: OrderSide, amount: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            amount,
            price: None,
            reduce_only: false,
            post_only: false,
            client_id: None,
        }
    }

    pub fn limit(symbol: &str, side: OrderSide, amount: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            amount,
            price: Some(price),
            reduce_only: false,
            post_only: false,
            client_id: None,
        }
    }
}

/// One leg of a WebSocket-initiated batched market submission.
#[derive(Debug, Clone)]
pub struct BatchMarketOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub reduce_only: bool,
}

/// Per-leg acknowledgments from a batch submit. Fills arrive later on the
/// order push stream, never here.
#[derive(Debug, Clone, Default)]
pub struct BatchSubmitResponse {
    pub orders: Vec<OrderState>,
    /// Legs the venue declined to enqueue (e.g. reduce-only with no
    /// position to reduce). A fully-skipped batch is not an error.
    pub skipped: Vec<String>,
}

/// Venue metadata returned by `get_exchange_info`.
#[derive(Debug, Clone)]
pub struct ExchangeInfo {
    pub name: String,
    pub id: String,
    /// Canonical symbols the venue supports from the monitored universe.
    pub symbols: Vec<String>,
    /// Instrument descriptors keyed by canonical symbol.
    pub instruments: HashMap<String, crate::types::InstrumentMeta>,
}

/// Result of a `health_check` probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub api_accessible: bool,
    pub latency_ms: u64,
    #[serde(default)]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// The facade
// ---------------------------------------------------------------------------

/// Uniform venue contract consumed by the aggregator, executor, and health
/// monitor.
///
/// Lifecycle: `connect` establishes transports and loads instrument
/// metadata; `authenticate` must precede private calls; `disconnect` tears
/// everything down. Subscription callbacks take `Option` because venues
/// with a single unified push callback register it once and accept `None`
/// for subsequent symbols.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Stable venue id ("backpack", "grvt", "lighter").
    fn id(&self) -> &str;

    // --- Lifecycle -----------------------------------------------------------
    async fn connect(&self) -> ExchangeResult<()>;
    async fn disconnect(&self) -> ExchangeResult<()>;
    async fn authenticate(&self) -> ExchangeResult<()>;
    async fn health_check(&self) -> ExchangeResult<HealthStatus>;

    // --- Market data ---------------------------------------------------------
    async fn get_exchange_info(&self) -> ExchangeResult<ExchangeInfo>;
    async fn get_supported_symbols(&self) -> ExchangeResult<Vec<String>>;
    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<TickerSnapshot>;
    async fn get_tickers(&self, symbols: &[String]) -> ExchangeResult<Vec<TickerSnapshot>>;
    async fn get_orderbook(
        &self,
        symbol: &str,
        limit: Option<u32>,
    ) -> ExchangeResult<OrderBookTop>;
    async fn get_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<i64>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<Candle>>;
    async fn get_trades(
        &self,
        symbol: &str,
        since: Option<i64>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<TradePrint>>;

    // --- Account -------------------------------------------------------------
    /// Cached for the configured TTL; `force_refresh` bypasses the cache.
    /// On refresh failure a non-empty prior cache is returned instead.
    async fn get_balances(&self, force_refresh: bool) -> ExchangeResult<Vec<Balance>>;
    /// Zero-net-quantity rows are suppressed.
    async fn get_positions(&self, symbols: Option<&[String]>) -> ExchangeResult<Vec<Position>>;

    // --- Orders --------------------------------------------------------------
    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderState>;
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderState>;
    /// MUST return the canceled orders. Venues whose native endpoint
    /// returns only a count fall back to [`cancel_all_by_listing`].
    async fn cancel_all_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderState>>;
    async fn get_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderState>;
    async fn get_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderState>>;
    async fn get_order_history(
        &self,
        symbol: Option<&str>,
        since: Option<i64>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<OrderState>>;

    // --- Streaming -----------------------------------------------------------
    async fn subscribe_ticker(
        &self,
        symbol: &str,
        callback: Option<TickerCallback>,
    ) -> ExchangeResult<()>;
    async fn subscribe_orderbook(
        &self,
        symbol: &str,
        callback: Option<BookCallback>,
    ) -> ExchangeResult<()>;
    async fn subscribe_trades(
        &self,
        symbol: &str,
        callback: Option<TradeCallback>,
    ) -> ExchangeResult<()>;
    /// Orders at minimum; fills and positions are supplementary feeds
    /// folded into the same callback as `OrderState` updates.
    async fn subscribe_user_data(&self, callback: OrderCallback) -> ExchangeResult<()>;
    async fn unsubscribe(&self, symbol: Option<&str>) -> ExchangeResult<()>;

    /// Venues whose push decoding runs through one unified callback per
    /// feed kind: the callback registers on the first subscribe and later
    /// symbols subscribe with `None`.
    fn uses_unified_stream_callbacks(&self) -> bool {
        false
    }

    // --- Batch capability ----------------------------------------------------
    fn supports_batch_market_orders(&self) -> bool {
        false
    }

    /// Submit a two-leg market batch atomically over WebSocket. Only the
    /// batch-capable venue implements this; everyone else reports
    /// `Unsupported` and the executor takes the REST path.
    async fn place_market_orders_batch(
        &self,
        _orders: &[BatchMarketOrder],
        _slippage_percent: f64,
    ) -> ExchangeResult<BatchSubmitResponse> {
        Err(ExchangeError::Unsupported(format!(
            "{}: batched market orders",
            self.id()
        )))
    }

    /// Venue-specific fill-wait override for market orders.
    fn market_order_timeout_override(&self) -> Option<Duration> {
        None
    }
}

// ---------------------------------------------------------------------------
// Shared fallback helpers
// ---------------------------------------------------------------------------

/// Cancel-all fallback for venues whose native endpoint returns only a
/// count: fetch open orders, cancel one by one, accumulate results. Orders
/// that reach a terminal state while we iterate are kept (cancel is
/// idempotent at the facade level).
pub async fn cancel_all_by_listing<A: ExchangeAdapter + ?Sized>(
    adapter: &A,
    symbol: Option<&str>,
) -> ExchangeResult<Vec<OrderState>> {
    let open = adapter.get_open_orders(symbol).await?;
    let mut canceled = Vec::with_capacity(open.len());
    for order in open {
        match adapter.cancel_order(&order.order_id, &order.symbol).await {
            Ok(state) => canceled.push(state),
            Err(ExchangeError::NotFound(_)) => {
                // Raced a fill/cancel; fetch the terminal state instead.
                if let Ok(state) = adapter.get_order(&order.order_id, &order.symbol).await {
                    canceled.push(state);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(canceled)
}

/// `get_order` fallback: when the live query 404s, re-query the history and
/// match by order id or client id. Only if both miss does the original
/// error surface.
pub async fn get_order_with_history_fallback<A: ExchangeAdapter + ?Sized>(
    adapter: &A,
    order_id: &str,
    symbol: &str,
) -> ExchangeResult<OrderState> {
    match adapter.get_order(order_id, symbol).await {
        Ok(order) => Ok(order),
        Err(ExchangeError::NotFound(msg)) => {
            let history = adapter
                .get_order_history(Some(symbol), None, Some(100))
                .await?;
            history
                .into_iter()
                .find(|o| {
                    o.order_id == order_id || o.client_id.as_deref() == Some(order_id)
                })
                .ok_or(ExchangeError::NotFound(msg))
        }
        Err(e) => Err(e),
    }
}
