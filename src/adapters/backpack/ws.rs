// =============================================================================
// Backpack WebSocket Client — public market streams
// =============================================================================
//
// Streams are symbol-keyed ("bookTicker.BTC_USDC_PERP",
// "markPrice.BTC_USDC_PERP"). The client owns its subscription set so a
// reconnect re-applies exactly the streams held before the drop.
//
// Callback registration is single-slot per (kind, symbol): re-registering
// replaces the previous callback, which keeps monitor-driven re-subscription
// idempotent.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::adapters::{BookCallback, TickerCallback, TradeCallback};
use crate::error::{ExchangeError, ExchangeResult};
use crate::types::{BookLevel, OrderBookTop, OrderSide, TickerSnapshot, TradePrint};

const WS_URL: &str = "wss://ws.backpack.exchange";

struct WsShared {
    ticker_callbacks: RwLock<HashMap<String, TickerCallback>>,
    book_callbacks: RwLock<HashMap<String, BookCallback>>,
    trade_callbacks: RwLock<HashMap<String, TradeCallback>>,
    /// Stream names currently subscribed; re-applied verbatim on reconnect.
    subscriptions: Mutex<BTreeSet<String>>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
}

pub struct BackpackWs {
    url: String,
    shared: Arc<WsShared>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl BackpackWs {
    pub fn new() -> Self {
        Self {
            url: WS_URL.to_string(),
            shared: Arc::new(WsShared {
                ticker_callbacks: RwLock::new(HashMap::new()),
                book_callbacks: RwLock::new(HashMap::new()),
                trade_callbacks: RwLock::new(HashMap::new()),
                subscriptions: Mutex::new(BTreeSet::new()),
                writer: Mutex::new(None),
                connected: AtomicBool::new(false),
            }),
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    pub async fn connect(&self) -> ExchangeResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let (ws_stream, _resp) = connect_async(&self.url).await.map_err(ExchangeError::from)?;
        info!(url = %self.url, "backpack WebSocket connected");
        let (mut sink, mut stream) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.shared.writer.lock() = Some(tx.clone());
        self.shared.connected.store(true, Ordering::Relaxed);

        // Writer task: drains the outbound channel into the sink.
        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    error!(error = %e, "backpack WebSocket write error");
                    break;
                }
            }
        });

        // Reader task: decodes frames and dispatches to callbacks.
        let shared = self.shared.clone();
        let pong_tx = tx.clone();
        let reader_handle = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(Message::Text(text)) => shared.dispatch_frame(&text),
                    Ok(Message::Ping(payload)) => {
                        let _ = pong_tx.send(Message::Pong(payload));
                    }
                    Ok(Message::Close(_)) | Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "backpack WebSocket read error");
                        break;
                    }
                }
            }
            shared.connected.store(false, Ordering::Relaxed);
            warn!("backpack WebSocket stream ended");
        });

        *self.reader_task.lock() = Some(reader_handle);
        *self.writer_task.lock() = Some(writer_handle);

        // Restore the subscription set held before a drop.
        let streams: Vec<String> = self.shared.subscriptions.lock().iter().cloned().collect();
        if !streams.is_empty() {
            self.send_subscribe(&streams)?;
            info!(count = streams.len(), "backpack subscriptions restored");
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::Relaxed);
        *self.shared.writer.lock() = None;
        if let Some(handle) = self.reader_task.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.writer_task.lock().take() {
            handle.abort();
        }
        info!("backpack WebSocket disconnected");
    }

    fn send_subscribe(&self, streams: &[String]) -> ExchangeResult<()> {
        let payload = json!({ "method": "SUBSCRIBE", "params": streams });
        self.send_text(payload.to_string())
    }

    fn send_text(&self, text: String) -> ExchangeResult<()> {
        let guard = self.shared.writer.lock();
        match guard.as_ref() {
            Some(tx) => tx
                .send(Message::Text(text))
                .map_err(|e| ExchangeError::Transport(format!("backpack ws send: {e}"))),
            None => Err(ExchangeError::Transport(
                "backpack ws not connected".into(),
            )),
        }
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    pub fn subscribe_ticker(
        &self,
        native_symbol: &str,
        callback: Option<TickerCallback>,
    ) -> ExchangeResult<()> {
        if let Some(cb) = callback {
            self.shared
                .ticker_callbacks
                .write()
                .insert(native_symbol.to_string(), cb);
        }
        self.track_and_subscribe(format!("markPrice.{native_symbol}"))
    }

    pub fn subscribe_orderbook(
        &self,
        native_symbol: &str,
        callback: Option<BookCallback>,
    ) -> ExchangeResult<()> {
        if let Some(cb) = callback {
            self.shared
                .book_callbacks
                .write()
                .insert(native_symbol.to_string(), cb);
        }
        self.track_and_subscribe(format!("bookTicker.{native_symbol}"))
    }

    pub fn subscribe_trades(
        &self,
        native_symbol: &str,
        callback: Option<TradeCallback>,
    ) -> ExchangeResult<()> {
        if let Some(cb) = callback {
            self.shared
                .trade_callbacks
                .write()
                .insert(native_symbol.to_string(), cb);
        }
        self.track_and_subscribe(format!("trade.{native_symbol}"))
    }

    fn track_and_subscribe(&self, stream: String) -> ExchangeResult<()> {
        let newly_added = self.shared.subscriptions.lock().insert(stream.clone());
        if self.is_connected() && newly_added {
            self.send_subscribe(&[stream])?;
        }
        Ok(())
    }

    /// Drop subscriptions (all, or just one symbol's streams).
    pub fn unsubscribe(&self, native_symbol: Option<&str>) -> ExchangeResult<()> {
        let removed: Vec<String> = {
            let mut subs = self.shared.subscriptions.lock();
            match native_symbol {
                Some(sym) => {
                    let matching: Vec<String> = subs
                        .iter()
                        .filter(|s| s.ends_with(&format!(".{sym}")))
                        .cloned()
                        .collect();
                    for s in &matching {
                        subs.remove(s);
                    }
                    matching
                }
                None => {
                    let all: Vec<String> = subs.iter().cloned().collect();
                    subs.clear();
                    all
                }
            }
        };
        if let Some(sym) = native_symbol {
            self.shared.ticker_callbacks.write().remove(sym);
            self.shared.book_callbacks.write().remove(sym);
            self.shared.trade_callbacks.write().remove(sym);
        } else {
            self.shared.ticker_callbacks.write().clear();
            self.shared.book_callbacks.write().clear();
            self.shared.trade_callbacks.write().clear();
        }
        if self.is_connected() && !removed.is_empty() {
            let payload = json!({ "method": "UNSUBSCRIBE", "params": removed });
            self.send_text(payload.to_string())?;
        }
        Ok(())
    }

    /// Subscribed stream names (used by tests and the health report).
    pub fn subscription_set(&self) -> Vec<String> {
        self.shared.subscriptions.lock().iter().cloned().collect()
    }
}

impl Default for BackpackWs {
    fn default() -> Self {
        Self::new()
    }
}

impl WsShared {
    /// Decode one push frame and fan out to the registered callback.
    fn dispatch_frame(&self, text: &str) {
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            debug!("backpack: undecodable frame");
            return;
        };
        let Some(stream) = frame.get("stream").and_then(|s| s.as_str()) else {
            return; // subscription acks etc.
        };
        let Some(data) = frame.get("data") else {
            return;
        };
        let Some((kind, symbol)) = stream.split_once('.') else {
            return;
        };

        match kind {
            "bookTicker" => {
                if let Some(book) = parse_book_ticker(symbol, data) {
                    if let Some(cb) = self.book_callbacks.read().get(symbol) {
                        cb(book);
                    }
                }
            }
            "markPrice" => {
                let ticker = parse_mark_price(symbol, data);
                if let Some(cb) = self.ticker_callbacks.read().get(symbol) {
                    cb(ticker);
                }
            }
            "trade" => {
                if let Some(print) = parse_trade_frame(symbol, data) {
                    if let Some(cb) = self.trade_callbacks.read().get(symbol) {
                        cb(print);
                    }
                }
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

fn str_num(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(|x| {
        x.as_f64()
            .or_else(|| x.as_str().and_then(|s| s.parse().ok()))
    })
}

fn parse_book_ticker(symbol: &str, data: &Value) -> Option<OrderBookTop> {
    let bid = str_num(data, "b")?;
    let ask = str_num(data, "a")?;
    Some(OrderBookTop {
        symbol: symbol.to_string(),
        best_bid: Some(BookLevel {
            price: bid,
            size: str_num(data, "B"),
        }),
        best_ask: Some(BookLevel {
            price: ask,
            size: str_num(data, "A"),
        }),
        event_time: Some(Utc::now()),
    })
}

fn parse_mark_price(symbol: &str, data: &Value) -> TickerSnapshot {
    TickerSnapshot {
        symbol: symbol.to_string(),
        mark: str_num(data, "p"),
        index: str_num(data, "i"),
        funding_rate: str_num(data, "f"),
        event_time: Some(Utc::now()),
        ..Default::default()
    }
}

fn parse_trade_frame(symbol: &str, data: &Value) -> Option<TradePrint> {
    Some(TradePrint {
        symbol: symbol.to_string(),
        price: str_num(data, "p")?,
        size: str_num(data, "q").unwrap_or(0.0),
        side: if data.get("m").and_then(|b| b.as_bool()).unwrap_or(false) {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        },
        event_time: Some(Utc::now()),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn book_ticker_frame_dispatches_to_callback() {
        let ws = BackpackWs::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        ws.subscribe_orderbook(
            "BTC_USDC_PERP",
            Some(Arc::new(move |book: OrderBookTop| {
                assert_eq!(book.symbol, "BTC_USDC_PERP");
                assert!(book.has_two_sides());
                hits2.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        let frame = json!({
            "stream": "bookTicker.BTC_USDC_PERP",
            "data": { "b": "64000.5", "B": "1.2", "a": "64001.0", "A": "0.8" }
        });
        ws.shared.dispatch_frame(&frame.to_string());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mark_price_frame_carries_funding() {
        let ws = BackpackWs::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        ws.subscribe_ticker(
            "ETH_USDC_PERP",
            Some(Arc::new(move |t: TickerSnapshot| {
                assert!((t.funding_rate.unwrap() - 0.0001).abs() < 1e-12);
                hits2.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        let frame = json!({
            "stream": "markPrice.ETH_USDC_PERP",
            "data": { "p": "3200.1", "f": "0.0001" }
        });
        ws.shared.dispatch_frame(&frame.to_string());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reregistering_replaces_the_callback() {
        let ws = BackpackWs::new();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        let c1 = first.clone();
        ws.subscribe_orderbook(
            "BTC_USDC_PERP",
            Some(Arc::new(move |_| {
                c1.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        let c2 = second.clone();
        ws.subscribe_orderbook(
            "BTC_USDC_PERP",
            Some(Arc::new(move |_| {
                c2.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        let frame = json!({
            "stream": "bookTicker.BTC_USDC_PERP",
            "data": { "b": "1", "a": "2" }
        });
        ws.shared.dispatch_frame(&frame.to_string());
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscription_set_survives_for_restore() {
        let ws = BackpackWs::new();
        ws.subscribe_orderbook("BTC_USDC_PERP", None).unwrap();
        ws.subscribe_ticker("BTC_USDC_PERP", None).unwrap();
        ws.subscribe_orderbook("ETH_USDC_PERP", None).unwrap();
        let set = ws.subscription_set();
        assert_eq!(
            set,
            vec![
                "bookTicker.BTC_USDC_PERP".to_string(),
                "bookTicker.ETH_USDC_PERP".to_string(),
                "markPrice.BTC_USDC_PERP".to_string(),
            ]
        );
    }

    #[test]
    fn unsubscribe_one_symbol_keeps_the_rest() {
        let ws = BackpackWs::new();
        ws.subscribe_orderbook("BTC_USDC_PERP", None).unwrap();
        ws.subscribe_orderbook("ETH_USDC_PERP", None).unwrap();
        ws.unsubscribe(Some("BTC_USDC_PERP")).unwrap();
        assert_eq!(
            ws.subscription_set(),
            vec!["bookTicker.ETH_USDC_PERP".to_string()]
        );
    }
}
