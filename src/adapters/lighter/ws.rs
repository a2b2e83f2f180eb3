// =============================================================================
// Lighter WebSocket Client — token auth, unified callbacks, batch submit
// =============================================================================
//
// Quirks this client absorbs:
//   - Auth is a token exchanged over REST and presented in the first frame.
//   - Push decoding uses ONE unified callback per feed kind: the first
//     `subscribe_*` call registers it, subsequent symbols subscribe with
//     `None` and ride the same callback (the callback dispatches on the
//     market field of the payload).
//   - Two-leg market orders can be submitted as one atomic batch; the ack
//     carries per-leg acknowledgments only. Fills arrive on the
//     account_orders stream.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::adapters::lighter::rest::{parse_book, parse_market_stats, parse_order};
use crate::adapters::{BatchSubmitResponse, BookCallback, OrderCallback, TickerCallback};
use crate::error::{ExchangeError, ExchangeResult};
use crate::types::OrderSide;

const WS_URL: &str = "wss://ws.lighter.xyz/stream";
const TESTNET_WS_URL: &str = "wss://ws.testnet.lighter.xyz/stream";

/// How long a batch submit waits for its acknowledgment frame.
const BATCH_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// One leg of a WebSocket batch submission, already in native terms.
#[derive(Debug, Clone)]
pub struct BatchLeg {
    pub market: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub reduce_only: bool,
}

struct LighterShared {
    /// Unified per-kind callbacks (single slot; payloads carry the market).
    book_callback: RwLock<Option<BookCallback>>,
    ticker_callback: RwLock<Option<TickerCallback>>,
    order_callbacks: RwLock<Vec<OrderCallback>>,
    /// Channel names ("order_book/BTC"); re-applied after reconnect.
    subscriptions: Mutex<BTreeSet<String>>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
    token: Mutex<Option<String>>,
    /// Batch submits in flight, keyed by request id.
    pending_batches: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
}

pub struct LighterWs {
    url: String,
    shared: Arc<LighterShared>,
    next_request_id: AtomicU64,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl LighterWs {
    pub fn new(testnet: bool) -> Self {
        Self {
            url: if testnet { TESTNET_WS_URL } else { WS_URL }.to_string(),
            shared: Arc::new(LighterShared {
                book_callback: RwLock::new(None),
                ticker_callback: RwLock::new(None),
                order_callbacks: RwLock::new(Vec::new()),
                subscriptions: Mutex::new(BTreeSet::new()),
                writer: Mutex::new(None),
                connected: AtomicBool::new(false),
                token: Mutex::new(None),
                pending_batches: Mutex::new(HashMap::new()),
            }),
            next_request_id: AtomicU64::new(1),
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    /// Store the auth token for the next connect (and re-auth on reconnect).
    pub fn set_token(&self, token: String) {
        *self.shared.token.lock() = Some(token);
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    pub async fn connect(&self) -> ExchangeResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let (ws_stream, _resp) = connect_async(&self.url).await.map_err(ExchangeError::from)?;
        info!(url = %self.url, "lighter WebSocket connected");
        let (mut sink, mut stream) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.shared.writer.lock() = Some(tx.clone());
        self.shared.connected.store(true, Ordering::Relaxed);

        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    error!(error = %e, "lighter WebSocket write error");
                    break;
                }
            }
        });

        let shared = self.shared.clone();
        let pong_tx = tx.clone();
        let reader_handle = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(Message::Text(text)) => dispatch_frame(&shared, &pong_tx, &text),
                    Ok(Message::Ping(payload)) => {
                        let _ = pong_tx.send(Message::Pong(payload));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "lighter WebSocket read error");
                        break;
                    }
                }
            }
            shared.connected.store(false, Ordering::Relaxed);
            warn!("lighter WebSocket stream ended");
        });

        *self.reader_task.lock() = Some(reader_handle);
        *self.writer_task.lock() = Some(writer_handle);

        // Authenticate first, then restore the channel set.
        if let Some(token) = self.shared.token.lock().clone() {
            self.send_json(json!({ "type": "auth", "token": token }))?;
        }
        let channels: Vec<String> = self.shared.subscriptions.lock().iter().cloned().collect();
        for channel in &channels {
            self.send_json(json!({ "type": "subscribe", "channel": channel }))?;
        }
        if !channels.is_empty() {
            info!(count = channels.len(), "lighter subscriptions restored");
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::Relaxed);
        *self.shared.writer.lock() = None;
        self.shared.pending_batches.lock().clear();
        if let Some(h) = self.reader_task.lock().take() {
            h.abort();
        }
        if let Some(h) = self.writer_task.lock().take() {
            h.abort();
        }
        info!("lighter WebSocket disconnected");
    }

    fn send_json(&self, value: Value) -> ExchangeResult<()> {
        let guard = self.shared.writer.lock();
        match guard.as_ref() {
            Some(tx) => tx
                .send(Message::Text(value.to_string()))
                .map_err(|e| ExchangeError::Transport(format!("lighter ws send: {e}"))),
            None => Err(ExchangeError::Transport("lighter ws not connected".into())),
        }
    }

    // -------------------------------------------------------------------------
    // Subscriptions (unified-callback pattern)
    // -------------------------------------------------------------------------

    pub fn subscribe_orderbook(
        &self,
        market: &str,
        callback: Option<BookCallback>,
    ) -> ExchangeResult<()> {
        if let Some(cb) = callback {
            *self.shared.book_callback.write() = Some(cb);
        }
        self.track_and_subscribe(format!("order_book/{market}"))
    }

    pub fn subscribe_ticker(
        &self,
        market: &str,
        callback: Option<TickerCallback>,
    ) -> ExchangeResult<()> {
        if let Some(cb) = callback {
            *self.shared.ticker_callback.write() = Some(cb);
        }
        self.track_and_subscribe(format!("market_stats/{market}"))
    }

    /// Order pushes for the authenticated account. Requires a token.
    pub fn subscribe_account_orders(&self, callback: OrderCallback) -> ExchangeResult<()> {
        if self.shared.token.lock().is_none() {
            return Err(ExchangeError::Auth(
                "lighter: account stream requires a token".into(),
            ));
        }
        self.shared.order_callbacks.write().push(callback);
        self.track_and_subscribe("account_orders".to_string())
    }

    fn track_and_subscribe(&self, channel: String) -> ExchangeResult<()> {
        let newly_added = self.shared.subscriptions.lock().insert(channel.clone());
        if self.is_connected() && newly_added {
            self.send_json(json!({ "type": "subscribe", "channel": channel }))?;
        }
        Ok(())
    }

    pub fn unsubscribe(&self, market: Option<&str>) -> ExchangeResult<()> {
        let removed: Vec<String> = {
            let mut subs = self.shared.subscriptions.lock();
            match market {
                Some(m) => {
                    let matching: Vec<String> = subs
                        .iter()
                        .filter(|c| c.ends_with(&format!("/{m}")))
                        .cloned()
                        .collect();
                    for c in &matching {
                        subs.remove(c);
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
        if market.is_none() {
            *self.shared.book_callback.write() = None;
            *self.shared.ticker_callback.write() = None;
            self.shared.order_callbacks.write().clear();
        }
        if self.is_connected() {
            for channel in &removed {
                self.send_json(json!({ "type": "unsubscribe", "channel": channel }))?;
            }
        }
        Ok(())
    }

    pub fn subscription_set(&self) -> Vec<String> {
        self.shared.subscriptions.lock().iter().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Batched market orders
    // -------------------------------------------------------------------------

    /// Submit up to two market legs atomically. The server enqueues both
    /// and replies with per-leg acknowledgments; fills follow on the
    /// account_orders stream.
    pub async fn submit_market_batch(
        &self,
        legs: &[BatchLeg],
        slippage_percent: f64,
    ) -> ExchangeResult<BatchSubmitResponse> {
        if !self.is_connected() {
            return Err(ExchangeError::Transport("lighter ws not connected".into()));
        }
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let orders: Vec<Value> = legs
            .iter()
            .map(|leg| {
                let mut o = json!({
                    "market": leg.market,
                    "side": match leg.side { OrderSide::Buy => "buy", OrderSide::Sell => "sell" },
                    "size": leg.quantity.to_string(),
                });
                if leg.reduce_only {
                    o["reduce_only"] = json!(true);
                }
                o
            })
            .collect();

        let (tx, rx) = oneshot::channel();
        self.shared.pending_batches.lock().insert(id, tx);

        let frame = json!({
            "type": "batch_create_market_orders",
            "id": id,
            "slippage_percent": slippage_percent,
            "orders": orders,
        });
        if let Err(e) = self.send_json(frame) {
            self.shared.pending_batches.lock().remove(&id);
            return Err(e);
        }

        let ack = match tokio::time::timeout(BATCH_ACK_TIMEOUT, rx).await {
            Ok(Ok(v)) => v,
            Ok(Err(_)) => {
                return Err(ExchangeError::Transport(
                    "lighter: batch ack channel dropped".into(),
                ))
            }
            Err(_) => {
                self.shared.pending_batches.lock().remove(&id);
                return Err(ExchangeError::Transport(
                    "lighter: batch submit timed out waiting for ack".into(),
                ));
            }
        };

        // Venue-level rejection rides inside the ack frame.
        if let Some(err) = ack.get("error") {
            let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("batch rejected")
                .to_string();
            return Err(ExchangeError::Venue { code, message });
        }

        let acked = ack
            .get("orders")
            .and_then(|o| o.as_array())
            .cloned()
            .unwrap_or_default();
        let skipped = ack
            .get("skipped_orders")
            .and_then(|s| s.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|x| x.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let orders = acked
            .iter()
            .filter_map(|o| {
                let market = o.get("market").and_then(|m| m.as_str()).unwrap_or("");
                parse_order(market, o)
            })
            .collect();

        Ok(BatchSubmitResponse { orders, skipped })
    }
}

// ---------------------------------------------------------------------------
// Frame dispatch
// ---------------------------------------------------------------------------

fn dispatch_frame(
    shared: &Arc<LighterShared>,
    writer: &mpsc::UnboundedSender<Message>,
    text: &str,
) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        debug!("lighter: undecodable frame");
        return;
    };
    let kind = frame.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match kind {
        "ping" => {
            let _ = writer.send(Message::Text(json!({ "type": "pong" }).to_string()));
        }
        "update/order_book" | "subscribed/order_book" => {
            // channel format: "order_book:BTC"
            let market = frame
                .get("channel")
                .and_then(|c| c.as_str())
                .and_then(|c| c.split(':').nth(1))
                .unwrap_or("");
            if market.is_empty() {
                return;
            }
            if let Some(payload) = frame.get("order_book") {
                let book = parse_book(market, payload);
                if let Some(cb) = shared.book_callback.read().as_ref() {
                    cb(book);
                }
            }
        }
        "update/market_stats" | "subscribed/market_stats" => {
            if let Some(stats) = frame.get("market_stats") {
                let market = stats
                    .get("market")
                    .and_then(|m| m.as_str())
                    .or_else(|| {
                        frame
                            .get("channel")
                            .and_then(|c| c.as_str())
                            .and_then(|c| c.split(':').nth(1))
                    })
                    .unwrap_or("");
                if market.is_empty() {
                    return;
                }
                let ticker = parse_market_stats(market, stats);
                if let Some(cb) = shared.ticker_callback.read().as_ref() {
                    cb(ticker);
                }
            }
        }
        "update/account_orders" | "subscribed/account_orders" => {
            let Some(orders) = frame.get("orders") else {
                return;
            };
            // Orders arrive either as a flat list or grouped by market.
            let flat: Vec<(String, Value)> = match orders {
                Value::Array(list) => list
                    .iter()
                    .map(|o| {
                        let m = o.get("market").and_then(|m| m.as_str()).unwrap_or("");
                        (m.to_string(), o.clone())
                    })
                    .collect(),
                Value::Object(map) => map
                    .iter()
                    .flat_map(|(market, list)| {
                        list.as_array()
                            .cloned()
                            .unwrap_or_default()
                            .into_iter()
                            .map(move |o| (market.clone(), o))
                    })
                    .collect(),
                _ => Vec::new(),
            };
            for (market, payload) in flat {
                if let Some(order) = parse_order(&market, &payload) {
                    for cb in shared.order_callbacks.read().iter() {
                        cb(order.clone());
                    }
                }
            }
        }
        "batch_create_market_orders_ack" | "error/batch_create_market_orders" => {
            let Some(id) = frame.get("id").and_then(|i| i.as_u64()) else {
                return;
            };
            if let Some(tx) = shared.pending_batches.lock().remove(&id) {
                let _ = tx.send(frame);
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
    use crate::types::OrderStatus;
    use std::sync::atomic::AtomicU32;

    fn noop_writer() -> mpsc::UnboundedSender<Message> {
        let (tx, _rx) = mpsc::unbounded_channel();
        tx
    }

    #[test]
    fn unified_book_callback_serves_every_market() {
        let ws = LighterWs::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        // First subscribe registers the callback; second passes None.
        ws.subscribe_orderbook(
            "BTC",
            Some(Arc::new(move |book| {
                seen2.lock().push(book.symbol.clone());
            })),
        )
        .unwrap();
        ws.subscribe_orderbook("ETH", None).unwrap();

        let writer = noop_writer();
        for market in ["BTC", "ETH"] {
            let frame = json!({
                "type": "update/order_book",
                "channel": format!("order_book:{market}"),
                "order_book": {
                    "bids": [{ "price": "100", "size": "1" }],
                    "asks": [{ "price": "101", "size": "1" }],
                }
            });
            dispatch_frame(&ws.shared, &writer, &frame.to_string());
        }
        assert_eq!(*seen.lock(), vec!["BTC".to_string(), "ETH".to_string()]);
    }

    #[test]
    fn account_order_pushes_fan_out() {
        let ws = LighterWs::new(false);
        ws.set_token("tok".into());
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        ws.subscribe_account_orders(Arc::new(move |order| {
            assert_eq!(order.status, OrderStatus::Filled);
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        let frame = json!({
            "type": "update/account_orders",
            "orders": {
                "BTC": [{
                    "order_id": 7,
                    "market": "BTC",
                    "side": "buy",
                    "type": "market",
                    "size": "1",
                    "filled_size": "1",
                    "status": "filled",
                }]
            }
        });
        dispatch_frame(&ws.shared, &noop_writer(), &frame.to_string());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn account_stream_requires_token() {
        let ws = LighterWs::new(false);
        let result = ws.subscribe_account_orders(Arc::new(|_| {}));
        assert!(matches!(result, Err(ExchangeError::Auth(_))));
    }

    #[test]
    fn batch_ack_resolves_pending_request() {
        let ws = LighterWs::new(false);
        let (tx, mut rx) = oneshot::channel();
        ws.shared.pending_batches.lock().insert(5, tx);

        let frame = json!({
            "type": "batch_create_market_orders_ack",
            "id": 5,
            "orders": [{ "order_id": 1, "market": "BTC", "side": "buy", "type": "market", "size": "1", "status": "open" }],
        });
        dispatch_frame(&ws.shared, &noop_writer(), &frame.to_string());
        let ack = rx.try_recv().expect("ack should resolve the pending batch");
        assert_eq!(ack.get("id").and_then(|i| i.as_u64()), Some(5));
        assert!(ws.shared.pending_batches.lock().is_empty());
    }

    #[test]
    fn channel_set_kept_for_restore() {
        let ws = LighterWs::new(false);
        ws.set_token("tok".into());
        ws.subscribe_orderbook("BTC", None).unwrap();
        ws.subscribe_ticker("BTC", None).unwrap();
        ws.subscribe_account_orders(Arc::new(|_| {})).unwrap();
        assert_eq!(
            ws.subscription_set(),
            vec![
                "account_orders".to_string(),
                "market_stats/BTC".to_string(),
                "order_book/BTC".to_string(),
            ]
        );
    }

    #[test]
    fn ping_frame_answers_pong() {
        let ws = LighterWs::new(false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatch_frame(&ws.shared, &tx, r#"{"type":"ping"}"#);
        match rx.try_recv() {
            Ok(Message::Text(text)) => assert!(text.contains("pong")),
            other => panic!("expected pong frame, got {other:?}"),
        }
    }
}
