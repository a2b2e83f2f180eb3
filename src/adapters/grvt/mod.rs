// =============================================================================
// GRVT Adapter — typed-data venue wiring
// =============================================================================
//
// Composition: `GrvtSession` owns the cookie lifecycle, `GrvtRest` the POST
// endpoints and EIP-712 signing, `GrvtWs` the JSON-RPC streams. The trade
// WebSocket receives the session credentials as upgrade headers, so
// `authenticate` must run before `subscribe_user_data`.
// =============================================================================

pub mod rest;
pub mod session;
pub mod sign;
pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{info, warn};

use crate::adapters::{
    cancel_all_by_listing, BookCallback, ExchangeAdapter, ExchangeInfo, HealthStatus,
    OrderCallback, OrderRequest, TickerCallback, TradeCallback,
};
use crate::error::{retry_idempotent, ExchangeError, ExchangeResult};
use crate::symbol::GrvtSymbols;
use crate::types::{
    Balance, Candle, InstrumentMeta, OrderBookTop, OrderState, Position, TickerSnapshot,
    TradePrint,
};
use crate::util::cache::TtlCache;

use rest::GrvtRest;
use session::GrvtSession;
use ws::GrvtWs;

const BALANCE_CACHE_KEY: &str = "balances";

pub struct GrvtAdapter {
    session: Arc<GrvtSession>,
    rest: GrvtRest,
    ws: GrvtWs,
    instruments: RwLock<HashMap<String, InstrumentMeta>>,
    balance_cache: Arc<TtlCache<&'static str, Vec<Balance>>>,
    enable_websocket: bool,
}

impl GrvtAdapter {
    pub fn new(config: &crate::config::VenueConfig, balance_ttl: Duration) -> Self {
        let session = Arc::new(GrvtSession::new(
            config.api_key.clone(),
            config.sub_account_id.clone(),
            config.testnet,
        ));
        let ws = GrvtWs::new(
            session.endpoints.market_ws.clone(),
            session.endpoints.trade_ws.clone(),
            config.sub_account_id.clone(),
        );
        Self {
            rest: GrvtRest::new(session.clone(), config.private_key.clone()),
            ws,
            session,
            instruments: RwLock::new(HashMap::new()),
            balance_cache: Arc::new(TtlCache::new(balance_ttl)),
            enable_websocket: config.enable_websocket,
        }
    }

    fn instrument(&self, canonical: &str) -> ExchangeResult<InstrumentMeta> {
        self.instruments
            .read()
            .get(canonical)
            .cloned()
            .ok_or_else(|| {
                ExchangeError::Consistency(format!("grvt: no instrument metadata for {canonical}"))
            })
    }

    async fn refresh_instruments(&self) -> ExchangeResult<usize> {
        let instruments = retry_idempotent(
            "grvt.instruments",
            3,
            Duration::from_secs(1),
            Duration::from_secs(10),
            || self.rest.get_instruments(),
        )
        .await?;
        let mut map = self.instruments.write();
        map.clear();
        for meta in instruments {
            if let Ok(canonical) = GrvtSymbols::normalize(&meta.symbol) {
                map.insert(canonical, meta);
            }
        }
        Ok(map.len())
    }

    fn fresh_client_id() -> String {
        // Client ids live in [2^63, 2^64) so they never collide with the
        // venue's own id space.
        rand::thread_rng().gen_range(u64::MAX / 2 + 1..=u64::MAX).to_string()
    }
}

#[async_trait]
impl ExchangeAdapter for GrvtAdapter {
    fn id(&self) -> &str {
        "grvt"
    }

    async fn connect(&self) -> ExchangeResult<()> {
        let count = self.refresh_instruments().await?;
        info!(instruments = count, "grvt connected");
        if self.enable_websocket {
            self.ws.connect_market().await?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> ExchangeResult<()> {
        self.ws.disconnect().await;
        self.session.drop_session();
        Ok(())
    }

    async fn authenticate(&self) -> ExchangeResult<()> {
        self.session.login().await?;
        info!("grvt authenticated");
        Ok(())
    }

    async fn health_check(&self) -> ExchangeResult<HealthStatus> {
        let started = Instant::now();
        let probe = self.rest.get_instruments();
        match tokio::time::timeout(Duration::from_secs(5), probe).await {
            Ok(Ok(_)) => Ok(HealthStatus {
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
            name: "GRVT".into(),
            id: self.id().into(),
            symbols: instruments.keys().cloned().collect(),
            instruments,
        })
    }

    async fn get_supported_symbols(&self) -> ExchangeResult<Vec<String>> {
        Ok(self.get_exchange_info().await?.symbols)
    }

    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<TickerSnapshot> {
        let native = GrvtSymbols::to_venue(symbol)?;
        self.rest.get_ticker(&native).await
    }

    async fn get_tickers(&self, symbols: &[String]) -> ExchangeResult<Vec<TickerSnapshot>> {
        let mut out = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            match self.get_ticker(symbol).await {
                Ok(t) => out.push(t),
                Err(e) => warn!(symbol = %symbol, error = %e, "grvt ticker fetch failed"),
            }
        }
        Ok(out)
    }

    async fn get_orderbook(
        &self,
        symbol: &str,
        limit: Option<u32>,
    ) -> ExchangeResult<OrderBookTop> {
        let native = GrvtSymbols::to_venue(symbol)?;
        self.rest.get_book(&native, limit.unwrap_or(10)).await
    }

    async fn get_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        _since: Option<i64>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<Candle>> {
        let native = GrvtSymbols::to_venue(symbol)?;
        self.rest.get_candles(&native, timeframe, limit).await
    }

    async fn get_trades(
        &self,
        symbol: &str,
        _since: Option<i64>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<TradePrint>> {
        let native = GrvtSymbols::to_venue(symbol)?;
        self.rest.get_trades(&native, limit).await
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
                        warn!(error = %e, "grvt balance refresh failed, serving stale cache");
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
            if let Ok(canonical) = GrvtSymbols::normalize(&p.symbol) {
                p.symbol = canonical;
            }
        }
        if let Some(filter) = symbols {
            positions.retain(|p| filter.iter().any(|s| s == &p.symbol));
        }
        Ok(positions)
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderState> {
        let native = GrvtSymbols::to_venue(&request.symbol)?;
        let meta = self.instrument(&request.symbol)?;
        let client_id = request
            .client_id
            .clone()
            .unwrap_or_else(Self::fresh_client_id);

        let mut order = self
            .rest
            .create_order(&native, &meta, request, &client_id)
            .await?;
        order.symbol = request.symbol.clone();
        if order.client_id.is_none() {
            order.client_id = Some(client_id);
        }
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderState> {
        match self.rest.cancel_order(order_id).await {
            Ok(mut order) => {
                order.symbol = symbol.to_string();
                Ok(order)
            }
            Err(ExchangeError::NotFound(_)) => {
                crate::adapters::get_order_with_history_fallback(self, order_id, symbol).await
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderState>> {
        // The native endpoint acknowledges a count only; callers need the
        // canceled orders, so walk the open set instead.
        cancel_all_by_listing(self, symbol).await
    }

    async fn get_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderState> {
        let mut order = self.rest.get_order(order_id).await?;
        order.symbol = symbol.to_string();
        Ok(order)
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderState>> {
        let native = symbol.map(GrvtSymbols::to_venue).transpose()?;
        let mut orders = self.rest.get_open_orders(native.as_deref()).await?;
        for o in &mut orders {
            if let Ok(canonical) = GrvtSymbols::normalize(&o.symbol) {
                o.symbol = canonical;
            }
        }
        Ok(orders)
    }

    async fn get_order_history(
        &self,
        symbol: Option<&str>,
        _since: Option<i64>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<OrderState>> {
        let native = symbol.map(GrvtSymbols::to_venue).transpose()?;
        let mut orders = self.rest.get_order_history(native.as_deref(), limit).await?;
        for o in &mut orders {
            if let Ok(canonical) = GrvtSymbols::normalize(&o.symbol) {
                o.symbol = canonical;
            }
        }
        Ok(orders)
    }

    async fn subscribe_ticker(
        &self,
        symbol: &str,
        callback: Option<TickerCallback>,
    ) -> ExchangeResult<()> {
        let native = GrvtSymbols::to_venue(symbol)?;
        // Push payloads carry native instruments; rewrite to canonical.
        let canonical = symbol.to_string();
        let wrapped = callback.map(|cb| {
            Arc::new(move |mut ticker: TickerSnapshot| {
                ticker.symbol = canonical.clone();
                cb(ticker);
            }) as TickerCallback
        });
        self.ws.subscribe_ticker(&native, wrapped)
    }

    async fn subscribe_orderbook(
        &self,
        symbol: &str,
        callback: Option<BookCallback>,
    ) -> ExchangeResult<()> {
        let native = GrvtSymbols::to_venue(symbol)?;
        let canonical = symbol.to_string();
        let wrapped = callback.map(|cb| {
            Arc::new(move |mut book: OrderBookTop| {
                book.symbol = canonical.clone();
                cb(book);
            }) as BookCallback
        });
        self.ws.subscribe_orderbook(&native, wrapped)
    }

    async fn subscribe_trades(
        &self,
        _symbol: &str,
        _callback: Option<TradeCallback>,
    ) -> ExchangeResult<()> {
        Err(ExchangeError::Unsupported("grvt: public trade stream".into()))
    }

    /// Private order pushes, parsed into `OrderState` before the callback.
    /// Requires a live session: the trade socket upgrade carries the cookie
    /// and account-id headers.
    async fn subscribe_user_data(&self, callback: OrderCallback) -> ExchangeResult<()> {
        self.session.ensure_authenticated().await?;
        let credentials = self.session.ws_credentials().ok_or_else(|| {
            ExchangeError::Auth("grvt: no session credentials for trade socket".into())
        })?;
        self.ws.connect_trade(credentials).await?;
        let balance_cache = self.balance_cache.clone();
        let wrapped: OrderCallback = Arc::new(move |mut order: OrderState| {
            if let Ok(canonical) = GrvtSymbols::normalize(&order.symbol) {
                order.symbol = canonical;
            }
            // A fill moves funds: the next balance read must hit the venue.
            if order.filled > 0.0 {
                balance_cache.invalidate(&BALANCE_CACHE_KEY);
            }
            callback(order);
        });
        self.ws.subscribe_orders(None, wrapped)
    }

    async fn unsubscribe(&self, symbol: Option<&str>) -> ExchangeResult<()> {
        let native = symbol.map(GrvtSymbols::to_venue).transpose()?;
        self.ws.unsubscribe(native.as_deref())
    }
}
