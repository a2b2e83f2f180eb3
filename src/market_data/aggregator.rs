// =============================================================================
// Market-Data Aggregator — queued fan-in of books and tickers, 100 Hz scan
// =============================================================================
//
// Ingestion is two bounded queues and two workers:
//
//   WS callback -> validate -> try_send          (never blocks, drops newest)
//   processor   -> drain batches of 50 -> caches (no analysis)
//   analysis    -> 100 Hz scan over the universe -> result queue (latest only)
//
// The aggregator exclusively owns the book/ticker caches; readers get
// cloned snapshots. Freshness is tracked by arrival time, never by the
// venue's event_time.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapters::{BookCallback, TickerCallback};
use crate::arbitrage::detector::{self, DetectorConfig};
use crate::arbitrage::models::ArbitrageOpportunity;
use crate::types::{OrderBookTop, TickerSnapshot};
use crate::util::throttle::LogThrottle;

const INGEST_QUEUE_CAPACITY: usize = 500;
const RESULT_QUEUE_CAPACITY: usize = 100;
const DRAIN_BATCH: usize = 50;
const ANALYSIS_PERIOD: Duration = Duration::from_millis(10);
const PROCESSOR_IDLE: Duration = Duration::from_millis(1);
const OVERFLOW_WARN_INTERVAL: Duration = Duration::from_secs(1);

struct IngestEvent<T> {
    venue: String,
    symbol: String,
    payload: T,
    arrival: Instant,
}

/// Performance counters exposed on the statistics surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregatorMetrics {
    pub book_queue_size: u64,
    pub ticker_queue_size: u64,
    pub result_queue_size: u64,
    pub books_processed: u64,
    pub tickers_processed: u64,
    pub books_dropped: u64,
    pub tickers_dropped: u64,
    pub last_analysis_latency_us: u64,
}

#[derive(Default)]
struct Counters {
    books_processed: AtomicU64,
    tickers_processed: AtomicU64,
    books_dropped: AtomicU64,
    tickers_dropped: AtomicU64,
    book_queue_size: AtomicU64,
    ticker_queue_size: AtomicU64,
    last_analysis_latency_us: AtomicU64,
}

type Key = (String, String); // (venue, symbol)

pub struct MarketDataAggregator {
    universe: Vec<String>,
    detector_config: DetectorConfig,

    books: RwLock<HashMap<Key, (OrderBookTop, Instant)>>,
    tickers: RwLock<HashMap<Key, (TickerSnapshot, Instant)>>,
    last_arrival: RwLock<HashMap<Key, Instant>>,

    book_tx: mpsc::Sender<IngestEvent<OrderBookTop>>,
    ticker_tx: mpsc::Sender<IngestEvent<TickerSnapshot>>,
    #[allow(clippy::type_complexity)]
    receivers: Mutex<
        Option<(
            mpsc::Receiver<IngestEvent<OrderBookTop>>,
            mpsc::Receiver<IngestEvent<TickerSnapshot>>,
        )>,
    >,

    results: Mutex<VecDeque<Vec<ArbitrageOpportunity>>>,
    results_ready: Notify,

    counters: Counters,
    overflow_throttle: LogThrottle,
    invariant_throttle: LogThrottle,
}

impl MarketDataAggregator {
    pub fn new(universe: Vec<String>, detector_config: DetectorConfig) -> Arc<Self> {
        let (book_tx, book_rx) = mpsc::channel(INGEST_QUEUE_CAPACITY);
        let (ticker_tx, ticker_rx) = mpsc::channel(INGEST_QUEUE_CAPACITY);
        Arc::new(Self {
            universe,
            detector_config,
            books: RwLock::new(HashMap::new()),
            tickers: RwLock::new(HashMap::new()),
            last_arrival: RwLock::new(HashMap::new()),
            book_tx,
            ticker_tx,
            receivers: Mutex::new(Some((book_rx, ticker_rx))),
            results: Mutex::new(VecDeque::new()),
            results_ready: Notify::new(),
            counters: Counters::default(),
            overflow_throttle: LogThrottle::new(),
            invariant_throttle: LogThrottle::new(),
        })
    }

    // -------------------------------------------------------------------------
    // Ingest (called from WebSocket callbacks; never blocks)
    // -------------------------------------------------------------------------

    /// Build a book callback for one venue. Validation happens here so the
    /// queue only ever carries usable samples.
    pub fn book_callback(self: &Arc<Self>, venue: &str) -> BookCallback {
        let aggregator = self.clone();
        let venue = venue.to_string();
        Arc::new(move |book: OrderBookTop| {
            aggregator.ingest_book(&venue, book);
        })
    }

    pub fn ticker_callback(self: &Arc<Self>, venue: &str) -> TickerCallback {
        let aggregator = self.clone();
        let venue = venue.to_string();
        Arc::new(move |ticker: TickerSnapshot| {
            aggregator.ingest_ticker(&venue, ticker);
        })
    }

    fn ingest_book(&self, venue: &str, book: OrderBookTop) {
        // Missing or non-positive sides: drop silently (no log storms).
        if !book.has_two_sides() {
            return;
        }
        // Crossed books are an invariant violation: log (throttled), drop.
        if book.is_crossed() {
            let key = format!("crossed:{venue}:{}", book.symbol);
            if self.invariant_throttle.should_log(&key, OVERFLOW_WARN_INTERVAL) {
                tracing::error!(
                    venue,
                    symbol = %book.symbol,
                    "crossed book sample discarded (bid >= ask)"
                );
            }
            return;
        }

        let event = IngestEvent {
            venue: venue.to_string(),
            symbol: book.symbol.clone(),
            payload: book,
            arrival: Instant::now(),
        };
        if let Err(TrySendError::Full(ev)) = self.book_tx.try_send(event) {
            self.counters.books_dropped.fetch_add(1, Ordering::Relaxed);
            if self
                .overflow_throttle
                .should_log("book_queue", OVERFLOW_WARN_INTERVAL)
            {
                warn!(venue = %ev.venue, symbol = %ev.symbol, "book queue full, dropping update");
            }
        }
    }

    fn ingest_ticker(&self, venue: &str, ticker: TickerSnapshot) {
        // The only downstream ticker consumer is funding-rate logic.
        if ticker.funding_rate.is_none() {
            return;
        }
        let event = IngestEvent {
            venue: venue.to_string(),
            symbol: ticker.symbol.clone(),
            payload: ticker,
            arrival: Instant::now(),
        };
        if let Err(TrySendError::Full(ev)) = self.ticker_tx.try_send(event) {
            self.counters.tickers_dropped.fetch_add(1, Ordering::Relaxed);
            if self
                .overflow_throttle
                .should_log("ticker_queue", OVERFLOW_WARN_INTERVAL)
            {
                warn!(venue = %ev.venue, symbol = %ev.symbol, "ticker queue full, dropping update");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Workers
    // -------------------------------------------------------------------------

    /// Spawn the ingest processor and the analysis worker. Called once; the
    /// returned handles are owned (and aborted) by the orchestrator.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let (mut book_rx, mut ticker_rx) = self
            .receivers
            .lock()
            .take()
            .expect("aggregator workers already started");

        let processor = {
            let aggregator = self.clone();
            tokio::spawn(async move {
                info!("aggregator ingest processor started");
                loop {
                    let mut drained = 0usize;
                    while drained < DRAIN_BATCH {
                        match book_rx.try_recv() {
                            Ok(ev) => {
                                aggregator.apply_book(ev);
                                drained += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    let mut drained = 0usize;
                    while drained < DRAIN_BATCH {
                        match ticker_rx.try_recv() {
                            Ok(ev) => {
                                aggregator.apply_ticker(ev);
                                drained += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    aggregator
                        .counters
                        .book_queue_size
                        .store(book_rx.len() as u64, Ordering::Relaxed);
                    aggregator
                        .counters
                        .ticker_queue_size
                        .store(ticker_rx.len() as u64, Ordering::Relaxed);
                    tokio::time::sleep(PROCESSOR_IDLE).await;
                }
            })
        };

        let analysis = {
            let aggregator = self.clone();
            tokio::spawn(async move {
                info!("aggregator analysis worker started");
                let mut interval = tokio::time::interval(ANALYSIS_PERIOD);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    aggregator.run_analysis_once();
                }
            })
        };

        vec![processor, analysis]
    }

    fn apply_book(&self, ev: IngestEvent<OrderBookTop>) {
        let key = (ev.venue, ev.symbol);
        self.last_arrival.write().insert(key.clone(), ev.arrival);
        self.books.write().insert(key, (ev.payload, ev.arrival));
        self.counters.books_processed.fetch_add(1, Ordering::Relaxed);
    }

    fn apply_ticker(&self, ev: IngestEvent<TickerSnapshot>) {
        let key = (ev.venue, ev.symbol);
        self.last_arrival.write().insert(key.clone(), ev.arrival);
        self.tickers.write().insert(key, (ev.payload, ev.arrival));
        self.counters.tickers_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// One full scan over the universe; publishes the result set.
    fn run_analysis_once(&self) {
        let started = Instant::now();
        let mut all = Vec::new();
        for symbol in &self.universe {
            let books = self.books_for_symbol(symbol);
            if books.len() < 2 {
                continue;
            }
            let rates = self.funding_rates_for_symbol(symbol);
            all.extend(detector::detect(
                &self.detector_config,
                symbol,
                &books,
                &rates,
            ));
        }

        self.counters
            .last_analysis_latency_us
            .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);

        // Evict stale result sets so consumers only ever observe the
        // latest scan.
        let mut results = self.results.lock();
        results.clear();
        results.push_back(all);
        while results.len() > RESULT_QUEUE_CAPACITY {
            results.pop_front();
        }
        drop(results);
        self.results_ready.notify_one();
    }

    /// Await the next published scan result.
    pub async fn next_results(&self) -> Vec<ArbitrageOpportunity> {
        loop {
            if let Some(results) = self.results.lock().pop_front() {
                return results;
            }
            self.results_ready.notified().await;
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Cached book if its arrival age is within `max_age` (inclusive).
    pub fn get_book(
        &self,
        venue: &str,
        symbol: &str,
        max_age: Duration,
    ) -> Option<OrderBookTop> {
        let key = (venue.to_string(), symbol.to_string());
        let guard = self.books.read();
        let (book, arrival) = guard.get(&key)?;
        if arrival.elapsed() <= max_age {
            Some(book.clone())
        } else {
            None
        }
    }

    pub fn get_ticker(&self, venue: &str, symbol: &str) -> Option<TickerSnapshot> {
        let key = (venue.to_string(), symbol.to_string());
        self.tickers.read().get(&key).map(|(t, _)| t.clone())
    }

    /// All cached two-sided books for a symbol, venue-keyed.
    fn books_for_symbol(&self, symbol: &str) -> Vec<(String, OrderBookTop)> {
        self.books
            .read()
            .iter()
            .filter(|((_, s), _)| s == symbol)
            .map(|((venue, _), (book, _))| (venue.clone(), book.clone()))
            .collect()
    }

    fn funding_rates_for_symbol(&self, symbol: &str) -> Vec<(String, f64)> {
        self.tickers
            .read()
            .iter()
            .filter(|((_, s), _)| s == symbol)
            .filter_map(|((venue, _), (ticker, _))| {
                ticker.funding_rate.map(|r| (venue.clone(), r))
            })
            .collect()
    }

    /// Staleness check for the health monitor: no sample ever, or the last
    /// arrival is older than `timeout`.
    pub fn is_stale(&self, venue: &str, symbol: &str, timeout: Duration) -> bool {
        let key = (venue.to_string(), symbol.to_string());
        match self.last_arrival.read().get(&key) {
            Some(arrival) => arrival.elapsed() > timeout,
            None => true,
        }
    }

    /// Seconds since the last sample for `(venue, symbol)`, if any arrived.
    pub fn staleness_seconds(&self, venue: &str, symbol: &str) -> Option<f64> {
        let key = (venue.to_string(), symbol.to_string());
        self.last_arrival
            .read()
            .get(&key)
            .map(|arrival| arrival.elapsed().as_secs_f64())
    }

    pub fn universe(&self) -> &[String] {
        &self.universe
    }

    pub fn metrics(&self) -> AggregatorMetrics {
        AggregatorMetrics {
            book_queue_size: self.counters.book_queue_size.load(Ordering::Relaxed),
            ticker_queue_size: self.counters.ticker_queue_size.load(Ordering::Relaxed),
            result_queue_size: self.results.lock().len() as u64,
            books_processed: self.counters.books_processed.load(Ordering::Relaxed),
            tickers_processed: self.counters.tickers_processed.load(Ordering::Relaxed),
            books_dropped: self.counters.books_dropped.load(Ordering::Relaxed),
            tickers_dropped: self.counters.tickers_dropped.load(Ordering::Relaxed),
            last_analysis_latency_us: self
                .counters
                .last_analysis_latency_us
                .load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BookLevel;

    fn book(symbol: &str, bid: f64, ask: f64) -> OrderBookTop {
        OrderBookTop {
            symbol: symbol.into(),
            best_bid: Some(BookLevel {
                price: bid,
                size: Some(10.0),
            }),
            best_ask: Some(BookLevel {
                price: ask,
                size: Some(10.0),
            }),
            event_time: None,
        }
    }

    fn aggregator() -> Arc<MarketDataAggregator> {
        MarketDataAggregator::new(
            vec!["BTC-USDC-PERP".to_string()],
            DetectorConfig {
                price_spread_threshold: 0.1,
                funding_rate_threshold: 0.0001,
            },
        )
    }

    fn apply(agg: &MarketDataAggregator, venue: &str, payload: OrderBookTop) {
        agg.apply_book(IngestEvent {
            venue: venue.into(),
            symbol: payload.symbol.clone(),
            payload,
            arrival: Instant::now(),
        });
    }

    #[tokio::test]
    async fn fresh_book_passes_freshness_query() {
        let agg = aggregator();
        apply(&agg, "backpack", book("BTC-USDC-PERP", 99.9, 100.0));
        assert!(agg
            .get_book("backpack", "BTC-USDC-PERP", Duration::from_secs(5))
            .is_some());
        // Zero max-age: the boundary is inclusive, so an immediate query
        // with elapsed ~0 still passes only if no time elapsed; a stale key
        // misses.
        assert!(agg
            .get_book("grvt", "BTC-USDC-PERP", Duration::from_secs(5))
            .is_none());
    }

    #[tokio::test]
    async fn invalid_books_dropped_on_ingest() {
        let agg = aggregator();
        // One-sided book: silent drop.
        agg.ingest_book(
            "backpack",
            OrderBookTop {
                symbol: "BTC-USDC-PERP".into(),
                best_bid: None,
                best_ask: Some(BookLevel {
                    price: 100.0,
                    size: Some(1.0),
                }),
                event_time: None,
            },
        );
        // Crossed book: logged (throttled) and dropped.
        agg.ingest_book("backpack", book("BTC-USDC-PERP", 101.0, 100.0));
        assert_eq!(agg.book_tx.capacity(), INGEST_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn funding_less_tickers_dropped() {
        let agg = aggregator();
        agg.ingest_ticker(
            "grvt",
            TickerSnapshot {
                symbol: "BTC-USDC-PERP".into(),
                funding_rate: None,
                ..Default::default()
            },
        );
        assert_eq!(agg.ticker_tx.capacity(), INGEST_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn queue_overflow_drops_newest_and_counts() {
        let agg = aggregator();
        for _ in 0..(INGEST_QUEUE_CAPACITY + 10) {
            agg.ingest_book("backpack", book("BTC-USDC-PERP", 99.9, 100.0));
        }
        assert_eq!(agg.metrics().books_dropped, 10);
    }

    #[tokio::test]
    async fn analysis_publishes_latest_scan_only() {
        let agg = aggregator();
        apply(&agg, "backpack", book("BTC-USDC-PERP", 99.9, 100.0));
        apply(&agg, "grvt", book("BTC-USDC-PERP", 100.5, 100.6));

        agg.run_analysis_once();
        agg.run_analysis_once(); // second scan evicts the first

        let results = agg.next_results().await;
        assert_eq!(results.len(), 1);
        let spread = results[0].price_spread.as_ref().unwrap();
        assert_eq!(spread.exchange_buy, "backpack");
        assert_eq!(spread.exchange_sell, "grvt");
        // Queue drained: exactly one result set was held.
        assert!(agg.results.lock().is_empty());
    }

    #[tokio::test]
    async fn staleness_reported_for_unseen_keys() {
        let agg = aggregator();
        assert!(agg.is_stale("backpack", "BTC-USDC-PERP", Duration::from_secs(90)));
        apply(&agg, "backpack", book("BTC-USDC-PERP", 99.9, 100.0));
        assert!(!agg.is_stale("backpack", "BTC-USDC-PERP", Duration::from_secs(90)));
        assert!(agg.staleness_seconds("backpack", "BTC-USDC-PERP").unwrap() < 1.0);
    }

    #[tokio::test]
    async fn processor_worker_moves_events_into_cache() {
        let agg = aggregator();
        let handles = agg.spawn_workers();
        let cb = agg.book_callback("backpack");
        cb(book("BTC-USDC-PERP", 99.9, 100.0));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(agg
            .get_book("backpack", "BTC-USDC-PERP", Duration::from_secs(5))
            .is_some());
        assert_eq!(agg.metrics().books_processed, 1);
        for h in handles {
            h.abort();
        }
    }
}
