// =============================================================================
// Backpack Adapter — ED25519 venue wiring
// =============================================================================
//
// REST carries all account/order traffic; the WebSocket is public market
// data only, so fill tracking for this venue goes through REST polling in
// the executor.
// =============================================================================

pub mod rest;
pub mod ws;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
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
use crate::symbol::{format_truncated, BackpackSymbols};
use crate::types::{
    Balance, Candle, InstrumentMeta, OrderBookTop, OrderState, Position, TickerSnapshot,
    TradePrint,
};
use crate::util::cache::TtlCache;

use rest::BackpackRest;
use ws::BackpackWs;

const BALANCE_CACHE_KEY: &str = "balances";

pub struct BackpackAdapter {
    rest: BackpackRest,
    ws: BackpackWs,
    /// Canonical symbol -> instrument descriptor, loaded on connect.
    instruments: RwLock<HashMap<String, InstrumentMeta>>,
    balance_cache: TtlCache<&'static str, Vec<Balance>>,
    authenticated: AtomicBool,
    has_credentials: bool,
    enable_websocket: bool,
}

impl BackpackAdapter {
    pub fn new(config: &crate::config::VenueConfig, balance_ttl: Duration) -> Self {
        // The signing secret may arrive as `private_key` or legacy
        // `api_secret`; both name the same base64 ED25519 seed.
        let secret = if config.private_key.is_empty() {
            &config.api_secret
        } else {
            &config.private_key
        };
        Self {
            rest: BackpackRest::new(config.api_key.clone(), secret, config.testnet),
            ws: BackpackWs::new(),
            instruments: RwLock::new(HashMap::new()),
            balance_cache: TtlCache::new(balance_ttl),
            authenticated: AtomicBool::new(false),
            has_credentials: !config.api_key.is_empty() && !secret.is_empty(),
            enable_websocket: config.enable_websocket,
        }
    }

    fn instrument(&self, canonical: &str) -> ExchangeResult<InstrumentMeta> {
        self.instruments
            .read()
            .get(canonical)
            .cloned()
            .ok_or_else(|| {
                ExchangeError::Consistency(format!("backpack: no instrument metadata for {canonical}"))
            })
    }

    async fn refresh_instruments(&self) -> ExchangeResult<usize> {
        // Connect-time read; transient transport failures retry here
        // rather than failing the whole session bring-up.
        let instruments = retry_idempotent(
            "backpack.instruments",
            3,
            Duration::from_secs(1),
            Duration::from_secs(10),
            || self.rest.get_instruments(),
        )
        .await?;
        let count = instruments.len();
        let mut map = self.instruments.write();
        map.clear();
        map.extend(instruments);
        Ok(count)
    }

    fn require_auth(&self) -> ExchangeResult<()> {
        if self.authenticated.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(ExchangeError::Auth("backpack: not authenticated".into()))
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BackpackAdapter {
    fn id(&self) -> &str {
        "backpack"
    }

    async fn connect(&self) -> ExchangeResult<()> {
        let count = self.refresh_instruments().await?;
        info!(instruments = count, "backpack connected");
        if self.enable_websocket {
            self.ws.connect().await?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> ExchangeResult<()> {
        self.ws.disconnect().await;
        self.authenticated.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn authenticate(&self) -> ExchangeResult<()> {
        if !self.has_credentials {
            return Err(ExchangeError::Auth(
                "backpack: api_key/private_key not configured".into(),
            ));
        }
        // ED25519 auth is per-request; a balance probe verifies the key pair.
        self.rest.get_balances().await?;
        self.authenticated.store(true, Ordering::Relaxed);
        info!("backpack authenticated");
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
            name: "Backpack".into(),
            id: self.id().into(),
            symbols: instruments.keys().cloned().collect(),
            instruments,
        })
    }

    async fn get_supported_symbols(&self) -> ExchangeResult<Vec<String>> {
        Ok(self.get_exchange_info().await?.symbols)
    }

    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<TickerSnapshot> {
        let native = BackpackSymbols::to_venue(symbol)?;
        self.rest.get_ticker(&native).await
    }

    async fn get_tickers(&self, symbols: &[String]) -> ExchangeResult<Vec<TickerSnapshot>> {
        let mut out = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            match self.get_ticker(symbol).await {
                Ok(t) => out.push(t),
                Err(e) => warn!(symbol = %symbol, error = %e, "backpack ticker fetch failed"),
            }
        }
        Ok(out)
    }

    async fn get_orderbook(
        &self,
        symbol: &str,
        _limit: Option<u32>,
    ) -> ExchangeResult<OrderBookTop> {
        let native = BackpackSymbols::to_venue(symbol)?;
        self.rest.get_depth(&native).await
    }

    async fn get_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        _since: Option<i64>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<Candle>> {
        let native = BackpackSymbols::to_venue(symbol)?;
        self.rest.get_klines(&native, timeframe, limit).await
    }

    async fn get_trades(
        &self,
        symbol: &str,
        _since: Option<i64>,
        limit: Option<u32>,
    ) -> ExchangeResult<Vec<TradePrint>> {
        let native = BackpackSymbols::to_venue(symbol)?;
        self.rest.get_recent_trades(&native, limit).await
    }

    async fn get_balances(&self, force_refresh: bool) -> ExchangeResult<Vec<Balance>> {
        self.require_auth()?;
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
                // Stale-on-error: a prior non-empty snapshot beats a failure.
                if let Some(stale) = self.balance_cache.get_stale(&BALANCE_CACHE_KEY) {
                    if !stale.is_empty() {
                        warn!(error = %e, "backpack balance refresh failed, serving stale cache");
                        return Ok(stale);
                    }
                }
                Err(e)
            }
        }
    }

    async fn get_positions(&self, symbols: Option<&[String]>) -> ExchangeResult<Vec<Position>> {
        self.require_auth()?;
        let mut positions = self.rest.get_positions().await?;
        // Positions come back native; normalize and optionally filter.
        for p in &mut positions {
            if let Ok(canonical) = BackpackSymbols::normalize(&p.symbol) {
                p.symbol = canonical;
            }
        }
        if let Some(filter) = symbols {
            positions.retain(|p| filter.iter().any(|s| s == &p.symbol));
        }
        Ok(positions)
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderState> {
        self.require_auth()?;
        let native = BackpackSymbols::to_venue(&request.symbol)?;
        let meta = self.instrument(&request.symbol)?;

        let quantity = format_truncated(request.amount, meta.quantity_decimals);
        let price = request
            .price
            .map(|p| format_truncated(p, meta.price_decimals));
        let client_id = match &request.client_id {
            Some(id) => id.parse::<u32>().ok(),
            None => Some(rand::thread_rng().gen::<u32>()),
        };

        let mut order = self
            .rest
            .execute_order(
                &native,
                request.side,
                request.order_type,
                &quantity,
                price.as_deref(),
                request.reduce_only,
                request.post_only,
                client_id,
            )
            .await?;
        order.symbol = request.symbol.clone();
        if order.amount == 0.0 {
            // Status-only plain-text ack: backfill from the request.
            order.amount = request.amount;
            order.remaining = request.amount - order.filled;
            order.side = request.side;
            order.order_type = request.order_type;
            order.price = request.price;
        }
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderState> {
        self.require_auth()?;
        let native = BackpackSymbols::to_venue(symbol)?;
        match self.rest.cancel_order(order_id, &native).await {
            Ok(mut order) => {
                order.symbol = symbol.to_string();
                Ok(order)
            }
            // Cancel is idempotent at this layer: an already-terminal order
            // resolves to its terminal state instead of an error.
            Err(ExchangeError::NotFound(_)) => {
                crate::adapters::get_order_with_history_fallback(self, order_id, symbol).await
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderState>> {
        self.require_auth()?;
        match symbol {
            Some(sym) => {
                let native = BackpackSymbols::to_venue(sym)?;
                let mut orders = self.rest.cancel_all(&native).await?;
                for o in &mut orders {
                    o.symbol = sym.to_string();
                }
                Ok(orders)
            }
            // No symbol filter on the native endpoint: walk open orders.
            None => cancel_all_by_listing(self, None).await,
        }
    }

    async fn get_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderState> {
        self.require_auth()?;
        let native = BackpackSymbols::to_venue(symbol)?;
        let mut order = self.rest.get_order(order_id, &native).await?;
        order.symbol = symbol.to_string();
        Ok(order)
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderState>> {
        self.require_auth()?;
        let native = symbol.map(BackpackSymbols::to_venue).transpose()?;
        let mut orders = self.rest.get_open_orders(native.as_deref()).await?;
        for o in &mut orders {
            if let Ok(canonical) = BackpackSymbols::normalize(&o.symbol) {
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
        self.require_auth()?;
        let native = symbol.map(BackpackSymbols::to_venue).transpose()?;
        let mut orders = self.rest.get_order_history(native.as_deref(), limit).await?;
        for o in &mut orders {
            if let Ok(canonical) = BackpackSymbols::normalize(&o.symbol) {
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
        let native = BackpackSymbols::to_venue(symbol)?;
        // Push payloads carry native symbols; rewrite to canonical before
        // the consumer sees them.
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
        let native = BackpackSymbols::to_venue(symbol)?;
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
        symbol: &str,
        callback: Option<TradeCallback>,
    ) -> ExchangeResult<()> {
        let native = BackpackSymbols::to_venue(symbol)?;
        let canonical = symbol.to_string();
        let wrapped = callback.map(|cb| {
            Arc::new(move |mut print: TradePrint| {
                print.symbol = canonical.clone();
                cb(print);
            }) as TradeCallback
        });
        self.ws.subscribe_trades(&native, wrapped)
    }

    async fn subscribe_user_data(&self, _callback: OrderCallback) -> ExchangeResult<()> {
        // The public WebSocket carries no private channels; the executor
        // tracks this venue's fills through REST polling instead.
        Err(ExchangeError::Unsupported(
            "backpack: private user-data stream".into(),
        ))
    }

    async fn unsubscribe(&self, symbol: Option<&str>) -> ExchangeResult<()> {
        let native = symbol.map(BackpackSymbols::to_venue).transpose()?;
        self.ws.unsubscribe(native.as_deref())
    }
}
