// =============================================================================
// Lighter Adapter — batch-capable venue wiring
// =============================================================================
//
// Market symbols on this venue are bare base assets ("BTC"), so the
// translator is built from the monitored universe. The WebSocket carries
// both market data (unified callbacks) and the batched market-order path;
// REST is the fallback for order CRUD and the repair flow.
// =============================================================================

pub mod rest;
pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{info, warn};

use crate::adapters::{
    BatchMarketOrder, BatchSubmitResponse, BookCallback, ExchangeAdapter, ExchangeInfo,
    HealthStatus, OrderCallback, OrderRequest, TickerCallback, TradeCallback,
};
use crate::error::{retry_idempotent, ExchangeError, ExchangeResult};
use crate::symbol::{format_truncated, LighterSymbols};
use crate::types::{
    Balance, Candle, InstrumentMeta, OrderBookTop, OrderState, Position, TickerSnapshot,
    TradePrint,
};
use crate::util::cache::TtlCache;

use rest::LighterRest;
use ws::{BatchLeg, LighterWs};

const BALANCE_CACHE_KEY: &str = "balances";

pub struct LighterAdapter {
    rest: LighterRest,
    ws: LighterWs,
    symbols: Arc<LighterSymbols>,
    instruments: RwLock<HashMap<String, InstrumentMeta>>,
    balance_cache: Arc<TtlCache<&'static str, Vec<Balance>>>,
    market_timeout: Duration,
    has_credentials: bool,
    enable_websocket: bool,
}

impl LighterAdapter {
    pub fn new(
        config: &crate::config::VenueConfig,
        universe: &[String],
        balance_ttl: Duration,
        market_timeout: Duration,
    ) -> Self {
        Self {
            rest: LighterRest::new(
                config.api_key.clone(),
                config.api_secret.clone(),
                config.testnet,
            ),
            ws: LighterWs::new(config.testnet),
            symbols: Arc::new(LighterSymbols::new(universe)),
            instruments: RwLock::new(HashMap::new()),
            balance_cache: Arc::new(TtlCache::new(balance_ttl)),
            market_timeout,
            has_credentials: !config.api_key.is_empty() && !config.api_secret.is_empty(),
            enable_websocket: config.enable_websocket,
        }
    }

    fn instrument(&self, canonical: &str) -> ExchangeResult<InstrumentMeta> {
        self.instruments
            .read()
            .get(canonical)
            .cloned()
            .ok_or_else(|| {
                ExchangeError::Consistency(format!(
                    "lighter: no instrument metadata for {canonical}"
                ))
            })
    }

    async fn refresh_instruments(&self) -> ExchangeResult<usize> {
        let markets = retry_idempotent(
            "lighter.markets",
            3,
            Duration::from_secs(1),
            Duration::from_secs(10),
            || self.rest.get_markets(),
        )
        .await?;
        let mut map = self.instruments.write();
        map.clear();
        for meta in markets {
            // Only markets inside the monitored universe are addressable.
            if let Ok(canonical) = self.symbols.normalize(&meta.symbol) {
                map.insert(canonical, meta);
            }
        }
        Ok(map.len())
    }

    fn fresh_client_id() -> String {
        rand::thread_rng()
            .gen_range(u64::MAX / 2 + 1..=u64::MAX)
            .to_string()
    }

    fn normalize_order(&self, mut order: OrderState) -> OrderState {
        if let Ok(canonical) = self.symbols.normalize(&order.symbol) {
            order.symbol = canonical;
        }
        order
    }
}

#[async_trait]
impl ExchangeAdapter for LighterAdapter {
    fn id(&self) -> &str {
        "lighter"
    }

    async fn connect(&self) -> ExchangeResult<()> {
        let count = self.refresh_instruments().await?;
        info!(markets = count, "lighter connected");
        if self.enable_websocket {
            self.ws.connect().await?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> ExchangeResult<()> {
        self.ws.disconnect().await;
        Ok(())
    }

    async fn authenticate(&self) -> ExchangeResult<()> {
        if !self.has_credentials {
            return Err(ExchangeError::Auth(
                "lighter: api_key/api_secret not configured".into(),
            ));
        }
        let token = self.rest.get_ws_token().await?;
        self.ws.set_token(token);
        info!("lighter authenticated");
        Ok(())
    }

    async fn health_check(&self) -> ExchangeResult<HealthStatus> {
        let started = Instant::now();
        match tokio::time::timeout(Duration::from_secs(5), self.rest.ping()).await {
            Ok(Ok(())) => Ok(HealthStatus {
                api_accessible: true,
                latency_ms: started.elapsed().as_millis() as u64,
                message: None,
            }),
            Ok(Err(e)) => Ok(HealthStatus {
                api_accessible: false,
                latency_ms: started.elapsed().as_millis() as u64,
                message: Some(e.to_string()),
            }),
            Err(_) => Ok(HealthStatus {
                api_accessible: false,
                latency_ms: 5000,
                message: Some("health probe timed out".into()),
            }),
        }
    }

    async fn get_exchange_info(&self) -> ExchangeResult<ExchangeInfo> {
        if self.instruments.read().is_empty() {
            self.refresh_instruments().await?;
        }
        let instruments = self.instruments.read().clone();
        Ok(ExchangeInfo {
            name: "Lighter".into(),
            id: self.id().into(),
            symbols: instruments.keys().cloned().collect(),
            instruments,
        })
    }

    async fn get_supported_symbols(&self) -> ExchangeResult<Vec<String>> {
        Ok(self.get_exchange_info().await?.symbols)
    }

    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<TickerSnapshot> {
        let market = self.symbols.to_venue(symbol)?;
        self.rest.get_ticker(&market).await
    }

    async fn get_tickers(&self, symbols: &[String]) -> ExchangeResult<Vec<TickerSnapshot>> {
        let mut out = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            match self.get_ticker(symbol).await {
                Ok(t) => out.push(t),
                Err(e) => warn!(symbol = %symbol, error = %e, "lighter ticker fetch failed"),
            }
        }
        Ok(out)
    }

    async fn get_orderbook(
        &self,
        symbol: &str,
        _limit: Option<u32>,
    ) -> ExchangeResult<OrderBookTop> {
        let market = self.symbols.to_venue(symbol)?;
        self.rest.get_book(&market).await
    }

    async fn get_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        _since: Option<i64>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<Candle>> {
        let market = self.symbols.to_venue(symbol)?;
        self.rest.get_candles(&market, timeframe, limit).await
    }

    async fn get_trades(
        &self,
        symbol: &str,
        _since: Option<i64>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<TradePrint>> {
        let market = self.symbols.to_venue(symbol)?;
        self.rest.get_recent_trades(&market, limit).await
    }

    async fn get_balances(&self, force_refresh: bool) -> ExchangeResult<Vec<Balance>> {
        if !force_refresh {
            if let Some(cached) = self.balance_cache.get(&BALANCE_CACHE_KEY) {
                return Ok(cached);
            }
        }
        match self.rest.get_balances().await {
            Ok(balances) => {
                self.balance_cache.insert(BALANCE_CACHE_KEY, balances.clone());
                Ok(balances)
            }
            Err(e) => {
                if let Some(stale) = self.balance_cache.get_stale(&BALANCE_CACHE_KEY) {
                    if !stale.is_empty() {
                        warn!(error = %e, "lighter balance refresh failed, serving stale cache");
                        return Ok(stale);
                    }
                }
                Err(e)
            }
        }
    }

    async fn get_positions(&self, symbols: Option<&[String]>) -> ExchangeResult<Vec<Position>> {
        let mut positions = self.rest.get_positions().await?;
        for p in &mut positions {
            if let Ok(canonical) = self.symbols.normalize(&p.symbol) {
                p.symbol = canonical;
            }
        }
        if let Some(filter) = symbols {
            positions.retain(|p| filter.iter().any(|s| s == &p.symbol));
        }
        Ok(positions)
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderState> {
        let market = self.symbols.to_venue(&request.symbol)?;
        let meta = self.instrument(&request.symbol)?;
        let quantity = format_truncated(request.amount, meta.quantity_decimals);
        let price = request
            .price
            .map(|p| format_truncated(p, meta.price_decimals));
        let client_id = request
            .client_id
            .clone()
            .unwrap_or_else(Self::fresh_client_id);

        let order = self
            .rest
            .create_order(
                &market,
                request.side,
                request.order_type,
                &quantity,
                price.as_deref(),
                request.reduce_only,
                &client_id,
            )
            .await?;
        Ok(self.normalize_order(order))
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderState> {
        let market = self.symbols.to_venue(symbol)?;
        match self.rest.cancel_order(order_id, &market).await {
            Ok(order) => Ok(self.normalize_order(order)),
            Err(ExchangeError::NotFound(_)) => {
                crate::adapters::get_order_with_history_fallback(self, order_id, symbol).await
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderState>> {
        crate::adapters::cancel_all_by_listing(self, symbol).await
    }

    async fn get_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderState> {
        let market = self.symbols.to_venue(symbol)?;
        let order = self.rest.get_order(order_id, &market).await?;
        Ok(self.normalize_order(order))
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderState>> {
        let market = symbol.map(|s| self.symbols.to_venue(s)).transpose()?;
        let orders = self.rest.get_open_orders(market.as_deref()).await?;
        Ok(orders.into_iter().map(|o| self.normalize_order(o)).collect())
    }

    async fn get_order_history(
        &self,
        symbol: Option<&str>,
        _since: Option<i64>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<OrderState>> {
        let market = symbol.map(|s| self.symbols.to_venue(s)).transpose()?;
        let orders = self.rest.get_order_history(market.as_deref(), limit).await?;
        Ok(orders.into_iter().map(|o| self.normalize_order(o)).collect())
    }

    async fn subscribe_ticker(
        &self,
        symbol: &str,
        callback: Option<TickerCallback>,
    ) -> ExchangeResult<()> {
        let market = self.symbols.to_venue(symbol)?;
        // The unified callback serves every market; translate per payload.
        let codec = self.symbols.clone();
        let wrapped = callback.map(|cb| {
            Arc::new(move |mut ticker: TickerSnapshot| {
                if let Ok(canonical) = codec.normalize(&ticker.symbol) {
                    ticker.symbol = canonical;
                    cb(ticker);
                }
            }) as TickerCallback
        });
        self.ws.subscribe_ticker(&market, wrapped)
    }

    async fn subscribe_orderbook(
        &self,
        symbol: &str,
        callback: Option<BookCallback>,
    ) -> ExchangeResult<()> {
        let market = self.symbols.to_venue(symbol)?;
        let codec = self.symbols.clone();
        let wrapped = callback.map(|cb| {
            Arc::new(move |mut book: OrderBookTop| {
                if let Ok(canonical) = codec.normalize(&book.symbol) {
                    book.symbol = canonical;
                    cb(book);
                }
            }) as BookCallback
        });
        self.ws.subscribe_orderbook(&market, wrapped)
    }

    async fn subscribe_trades(
        &self,
        _symbol: &str,
        _callback: Option<TradeCallback>,
    ) -> ExchangeResult<()> {
        Err(ExchangeError::Unsupported(
            "lighter: public trade stream".into(),
        ))
    }

    async fn subscribe_user_data(&self, callback: OrderCallback) -> ExchangeResult<()> {
        let codec = self.symbols.clone();
        let balance_cache = self.balance_cache.clone();
        let wrapped: OrderCallback = Arc::new(move |mut order: OrderState| {
            if let Ok(canonical) = codec.normalize(&order.symbol) {
                order.symbol = canonical;
            }
            if order.filled > 0.0 {
                balance_cache.invalidate(&BALANCE_CACHE_KEY);
            }
            callback(order);
        });
        self.ws.subscribe_account_orders(wrapped)
    }

    async fn unsubscribe(&self, symbol: Option<&str>) -> ExchangeResult<()> {
        let market = symbol.map(|s| self.symbols.to_venue(s)).transpose()?;
        self.ws.unsubscribe(market.as_deref())
    }

    // --- Batch capability ----------------------------------------------------

    fn uses_unified_stream_callbacks(&self) -> bool {
        true
    }

    fn supports_batch_market_orders(&self) -> bool {
        true
    }

    async fn place_market_orders_batch(
        &self,
        orders: &[BatchMarketOrder],
        slippage_percent: f64,
    ) -> ExchangeResult<BatchSubmitResponse> {
        let mut legs = Vec::with_capacity(orders.len());
        for order in orders {
            let market = self.symbols.to_venue(&order.symbol)?;
            let meta = self.instrument(&order.symbol)?;
            let quantity: f64 = format_truncated(order.quantity, meta.quantity_decimals)
                .parse()
                .unwrap_or(order.quantity);
            legs.push(BatchLeg {
                market,
                side: order.side,
                quantity,
                reduce_only: order.reduce_only,
            });
        }
        let mut response = self.ws.submit_market_batch(&legs, slippage_percent).await?;
        response.orders = response
            .orders
            .into_iter()
            .map(|o| self.normalize_order(o))
            .collect();
        Ok(response)
    }

    fn market_order_timeout_override(&self) -> Option<Duration> {
        Some(self.market_timeout)
    }
}
