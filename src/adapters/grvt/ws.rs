// =============================================================================
// GRVT WebSocket Client — JSON-RPC subscriptions over two sockets
// =============================================================================
//
// Subscribe/unsubscribe are JSON-RPC envelopes:
//
//   {"jsonrpc":"2.0","method":"subscribe",
//    "params":{"stream":"v1.book.s","selectors":["BTC_USDT_Perp@500-10"]},
//    "id":1}
//
// Data frames are NOT JSON-RPC; they arrive bare:
//
//   {"stream":"v1.book.s","selector":"BTC_USDT_Perp@500-10",
//    "sequence_number":"8726","feed":{...}}
//
// Market data flows on the market socket (no auth). Private streams
// (v1.order, v1.position) flow on the trade socket, whose HTTP upgrade must
// carry the session cookie and the X-Grvt-Account-Id header. Private
// selectors encode the sub-account id: "<sub>-all", "<sub>-<instrument>",
// or bare "<sub>" for positions.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::adapters::grvt::rest::{parse_book, parse_order, parse_ticker};
use crate::adapters::{BookCallback, OrderCallback, TickerCallback};
use crate::error::{ExchangeError, ExchangeResult};

pub const STREAM_TICKER: &str = "v1.ticker.s";
pub const STREAM_BOOK: &str = "v1.book.s";
pub const STREAM_ORDER: &str = "v1.order";
pub const STREAM_POSITION: &str = "v1.position";

const DEFAULT_RATE_MS: u32 = 500;
const DEFAULT_BOOK_DEPTH: u32 = 10;

struct Socket {
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    /// `(stream, selector)` pairs; re-applied verbatim after reconnect.
    subscriptions: Mutex<BTreeSet<(String, String)>>,
}

impl Socket {
    fn new() -> Self {
        Self {
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
            subscriptions: Mutex::new(BTreeSet::new()),
        }
    }

    fn teardown(&self) {
        self.connected.store(false, Ordering::Relaxed);
        *self.writer.lock() = None;
        if let Some(h) = self.reader_task.lock().take() {
            h.abort();
        }
        if let Some(h) = self.writer_task.lock().take() {
            h.abort();
        }
    }
}

struct Callbacks {
    /// Keyed by native instrument; single slot so re-registration replaces.
    ticker: RwLock<HashMap<String, TickerCallback>>,
    book: RwLock<HashMap<String, BookCallback>>,
    orders: RwLock<Vec<OrderCallback>>,
}

pub struct GrvtWs {
    market_url: String,
    trade_url: String,
    sub_account_id: String,
    market: Arc<Socket>,
    trade: Arc<Socket>,
    callbacks: Arc<Callbacks>,
    request_id: AtomicU64,
}

impl GrvtWs {
    pub fn new(market_url: String, trade_url: String, sub_account_id: String) -> Self {
        Self {
            market_url,
            trade_url,
            sub_account_id,
            market: Arc::new(Socket::new()),
            trade: Arc::new(Socket::new()),
            callbacks: Arc::new(Callbacks {
                ticker: RwLock::new(HashMap::new()),
                book: RwLock::new(HashMap::new()),
                orders: RwLock::new(Vec::new()),
            }),
            request_id: AtomicU64::new(1),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.market.connected.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    /// Connect the public market socket and restore its subscriptions.
    pub async fn connect_market(&self) -> ExchangeResult<()> {
        if self.market.connected.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.open_socket(&self.market_url, &self.market, None).await?;
        self.restore_subscriptions(&self.market)?;
        info!("grvt market WebSocket connected");
        Ok(())
    }

    /// Connect the private trade socket. `credentials` are the session
    /// cookie and account id, sent as HTTP upgrade headers.
    pub async fn connect_trade(&self, credentials: (String, String)) -> ExchangeResult<()> {
        if self.trade.connected.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.open_socket(&self.trade_url, &self.trade, Some(credentials))
            .await?;
        self.restore_subscriptions(&self.trade)?;
        info!("grvt trade WebSocket connected");
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.market.teardown();
        self.trade.teardown();
        info!("grvt WebSockets disconnected");
    }

    async fn open_socket(
        &self,
        url: &str,
        socket: &Arc<Socket>,
        credentials: Option<(String, String)>,
    ) -> ExchangeResult<()> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ExchangeError::Transport(format!("grvt ws request: {e}")))?;
        if let Some((cookie, account_id)) = credentials {
            let headers = request.headers_mut();
            headers.insert(
                "Cookie",
                HeaderValue::from_str(&cookie)
                    .map_err(|e| ExchangeError::Auth(format!("grvt ws cookie header: {e}")))?,
            );
            headers.insert(
                "X-Grvt-Account-Id",
                HeaderValue::from_str(&account_id)
                    .map_err(|e| ExchangeError::Auth(format!("grvt ws account header: {e}")))?,
            );
        }

        let (ws_stream, _resp) = connect_async(request).await.map_err(ExchangeError::from)?;
        let (mut sink, mut stream) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *socket.writer.lock() = Some(tx.clone());
        socket.connected.store(true, Ordering::Relaxed);

        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    error!(error = %e, "grvt WebSocket write error");
                    break;
                }
            }
        });

        let callbacks = self.callbacks.clone();
        let socket_for_reader = socket.clone();
        let pong_tx = tx;
        let reader_handle = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(Message::Text(text)) => dispatch_frame(&callbacks, &text),
                    Ok(Message::Ping(payload)) => {
                        let _ = pong_tx.send(Message::Pong(payload));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "grvt WebSocket read error");
                        break;
                    }
                }
            }
            socket_for_reader.connected.store(false, Ordering::Relaxed);
            warn!("grvt WebSocket stream ended");
        });

        *socket.reader_task.lock() = Some(reader_handle);
        *socket.writer_task.lock() = Some(writer_handle);
        Ok(())
    }

    fn restore_subscriptions(&self, socket: &Socket) -> ExchangeResult<()> {
        let subs: Vec<(String, String)> = socket.subscriptions.lock().iter().cloned().collect();
        for (stream, selector) in &subs {
            self.send_rpc(socket, "subscribe", stream, selector)?;
        }
        if !subs.is_empty() {
            info!(count = subs.len(), "grvt subscriptions restored");
        }
        Ok(())
    }

    fn send_rpc(
        &self,
        socket: &Socket,
        method: &str,
        stream: &str,
        selector: &str,
    ) -> ExchangeResult<()> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": { "stream": stream, "selectors": [selector] },
            "id": id,
        });
        let guard = socket.writer.lock();
        match guard.as_ref() {
            Some(tx) => tx
                .send(Message::Text(payload.to_string()))
                .map_err(|e| ExchangeError::Transport(format!("grvt ws send: {e}"))),
            None => Err(ExchangeError::Transport("grvt ws not connected".into())),
        }
    }

    fn track_and_subscribe(
        &self,
        socket: &Socket,
        stream: &str,
        selector: String,
    ) -> ExchangeResult<()> {
        let newly_added = socket
            .subscriptions
            .lock()
            .insert((stream.to_string(), selector.clone()));
        if socket.connected.load(Ordering::Relaxed) && newly_added {
            self.send_rpc(socket, "subscribe", stream, &selector)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Market subscriptions
    // -------------------------------------------------------------------------

    pub fn subscribe_ticker(
        &self,
        native_symbol: &str,
        callback: Option<TickerCallback>,
    ) -> ExchangeResult<()> {
        if let Some(cb) = callback {
            self.callbacks
                .ticker
                .write()
                .insert(native_symbol.to_string(), cb);
        }
        let selector = format!("{native_symbol}@{DEFAULT_RATE_MS}");
        self.track_and_subscribe(&self.market, STREAM_TICKER, selector)
    }

    pub fn subscribe_orderbook(
        &self,
        native_symbol: &str,
        callback: Option<BookCallback>,
    ) -> ExchangeResult<()> {
        if let Some(cb) = callback {
            self.callbacks
                .book
                .write()
                .insert(native_symbol.to_string(), cb);
        }
        let selector = format!("{native_symbol}@{DEFAULT_RATE_MS}-{DEFAULT_BOOK_DEPTH}");
        self.track_and_subscribe(&self.market, STREAM_BOOK, selector)
    }

    // -------------------------------------------------------------------------
    // Private subscriptions
    // -------------------------------------------------------------------------

    /// Subscribe to order pushes. `symbol: None` covers every instrument
    /// ("<sub>-all").
    pub fn subscribe_orders(
        &self,
        symbol: Option<&str>,
        callback: OrderCallback,
    ) -> ExchangeResult<()> {
        self.callbacks.orders.write().push(callback);
        let selector = match symbol {
            Some(sym) => format!("{}-{}", self.sub_account_id, sym),
            None => format!("{}-all", self.sub_account_id),
        };
        self.track_and_subscribe(&self.trade, STREAM_ORDER, selector)
    }

    /// Position stream subscription. Positions are read via REST; this
    /// keeps the selector registered so the feed can be tapped later.
    pub fn subscribe_positions(&self, symbol: Option<&str>) -> ExchangeResult<()> {
        let selector = match symbol {
            Some(sym) => format!("{}-{}", self.sub_account_id, sym),
            None => self.sub_account_id.clone(),
        };
        self.track_and_subscribe(&self.trade, STREAM_POSITION, selector)
    }

    // -------------------------------------------------------------------------
    // Unsubscribe
    // -------------------------------------------------------------------------

    pub fn unsubscribe(&self, native_symbol: Option<&str>) -> ExchangeResult<()> {
        for socket in [&self.market, &self.trade] {
            let removed: Vec<(String, String)> = {
                let mut subs = socket.subscriptions.lock();
                match native_symbol {
                    Some(sym) => {
                        let matching: Vec<(String, String)> = subs
                            .iter()
                            .filter(|(_, sel)| selector_symbol(sel) == sym)
                            .cloned()
                            .collect();
                        for pair in &matching {
                            subs.remove(pair);
                        }
                        matching
                    }
                    None => {
                        let all: Vec<(String, String)> = subs.iter().cloned().collect();
                        subs.clear();
                        all
                    }
                }
            };
            if socket.connected.load(Ordering::Relaxed) {
                for (stream, selector) in &removed {
                    self.send_rpc(socket, "unsubscribe", stream, selector)?;
                }
            }
        }
        match native_symbol {
            Some(sym) => {
                self.callbacks.ticker.write().remove(sym);
                self.callbacks.book.write().remove(sym);
            }
            None => {
                self.callbacks.ticker.write().clear();
                self.callbacks.book.write().clear();
                self.callbacks.orders.write().clear();
            }
        }
        Ok(())
    }

    /// Market subscription pairs (used by tests and the health report).
    pub fn market_subscription_set(&self) -> Vec<(String, String)> {
        self.market.subscriptions.lock().iter().cloned().collect()
    }
}

/// Instrument part of a selector: "BTC_USDT_Perp@500-10" -> "BTC_USDT_Perp",
/// "1234-BTC_USDT_Perp" -> "BTC_USDT_Perp".
fn selector_symbol(selector: &str) -> &str {
    let head = selector.split('@').next().unwrap_or(selector);
    match head.split_once('-') {
        Some((_, tail)) if !tail.is_empty() => tail,
        _ => head,
    }
}

/// Decode one bare data frame and fan out.
fn dispatch_frame(callbacks: &Callbacks, text: &str) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        debug!("grvt: undecodable frame");
        return;
    };
    let Some(stream) = frame.get("stream").and_then(|s| s.as_str()) else {
        return; // JSON-RPC ack
    };
    let Some(feed) = frame.get("feed") else {
        return;
    };
    let selector = frame.get("selector").and_then(|s| s.as_str()).unwrap_or("");

    match stream {
        STREAM_TICKER => {
            let symbol = selector.split('@').next().unwrap_or(selector);
            let ticker = parse_ticker(symbol, feed);
            if let Some(cb) = callbacks.ticker.read().get(symbol) {
                cb(ticker);
            }
        }
        STREAM_BOOK => {
            let symbol = selector.split('@').next().unwrap_or(selector);
            let book = parse_book(symbol, feed);
            if let Some(cb) = callbacks.book.read().get(symbol) {
                cb(book);
            }
        }
        STREAM_ORDER => {
            if let Some(order) = parse_order(feed) {
                for cb in callbacks.orders.read().iter() {
                    cb(order.clone());
                }
            }
        }
        _ => {}
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn test_ws() -> GrvtWs {
        GrvtWs::new(
            "wss://market-data.grvt.io/ws".into(),
            "wss://trades.grvt.io/ws".into(),
            "8566".into(),
        )
    }

    #[test]
    fn selector_symbol_extraction() {
        assert_eq!(selector_symbol("BTC_USDT_Perp@500-10"), "BTC_USDT_Perp");
        assert_eq!(selector_symbol("8566-BTC_USDT_Perp"), "BTC_USDT_Perp");
        assert_eq!(selector_symbol("8566"), "8566");
    }

    #[test]
    fn market_selectors_encode_rate_and_depth() {
        let ws = test_ws();
        ws.subscribe_ticker("BTC_USDT_Perp", None).unwrap();
        ws.subscribe_orderbook("BTC_USDT_Perp", None).unwrap();
        let set = ws.market_subscription_set();
        assert!(set.contains(&(
            STREAM_TICKER.to_string(),
            "BTC_USDT_Perp@500".to_string()
        )));
        assert!(set.contains(&(
            STREAM_BOOK.to_string(),
            "BTC_USDT_Perp@500-10".to_string()
        )));
    }

    #[test]
    fn private_selectors_encode_sub_account() {
        let ws = test_ws();
        ws.subscribe_orders(None, Arc::new(|_| {})).unwrap();
        ws.subscribe_orders(Some("BTC_USDT_Perp"), Arc::new(|_| {}))
            .unwrap();
        let subs: Vec<(String, String)> =
            ws.trade.subscriptions.lock().iter().cloned().collect();
        assert!(subs.contains(&(STREAM_ORDER.to_string(), "8566-all".to_string())));
        assert!(subs.contains(&(
            STREAM_ORDER.to_string(),
            "8566-BTC_USDT_Perp".to_string()
        )));
    }

    #[test]
    fn book_frame_dispatches_by_selector_symbol() {
        let ws = test_ws();
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        ws.subscribe_orderbook(
            "BTC_USDT_Perp",
            Some(Arc::new(move |book| {
                assert_eq!(book.symbol, "BTC_USDT_Perp");
                hits2.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        let frame = json!({
            "stream": STREAM_BOOK,
            "selector": "BTC_USDT_Perp@500-10",
            "sequence_number": "123",
            "feed": {
                "bids": [{ "price": "64000", "size": "1" }],
                "asks": [{ "price": "64001", "size": "2" }],
            }
        });
        dispatch_frame(&ws.callbacks, &frame.to_string());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn order_frame_fans_out_to_all_order_callbacks() {
        let ws = test_ws();
        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..2 {
            let h = hits.clone();
            ws.subscribe_orders(
                None,
                Arc::new(move |order| {
                    assert_eq!(order.symbol, "BTC_USDT_Perp");
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        }

        let frame = json!({
            "stream": STREAM_ORDER,
            "selector": "8566-all",
            "feed": {
                "order_id": "0xabc",
                "is_market": true,
                "legs": [{ "instrument": "BTC_USDT_Perp", "size": "1", "is_buying_asset": true }],
                "state": { "status": "FILLED" },
            }
        });
        dispatch_frame(&ws.callbacks, &frame.to_string());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rpc_ack_frames_are_ignored() {
        let ws = test_ws();
        dispatch_frame(&ws.callbacks, r#"{"jsonrpc":"2.0","result":{},"id":1}"#);
        // No panic, nothing dispatched.
    }
}
