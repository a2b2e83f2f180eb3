// =============================================================================
// Risk Gates — price stability, opposing liquidity, dual-limit backoff
// =============================================================================
//
// Three independent gates evaluated before every submission. All of their
// log output is state-throttled: these run inside the scan loop and would
// otherwise print hundreds of identical lines per second.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::{OrderExecutionConfig, PriceStabilityConfig, RuntimeConfig};
use crate::market_data::MarketDataAggregator;
use crate::types::QTY_EPSILON;
use crate::util::throttle::StateThrottle;

const THROTTLE_STABILITY_COLLECTING: Duration = Duration::from_secs(30);
const THROTTLE_STABILITY_VOLATILE: Duration = Duration::from_secs(60);
const THROTTLE_LIQUIDITY_INSUFFICIENT: Duration = Duration::from_secs(20);
const THROTTLE_LIQUIDITY_OK: Duration = Duration::from_secs(40);
const THROTTLE_LIQUIDITY_AGGREGATE: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Price stability
// ---------------------------------------------------------------------------

/// Sliding window of `(t, buy_price, sell_price)` samples per symbol.
/// Passing requires the window to be fully covered AND both sides to stay
/// within the volatility threshold; any breach resets the log to the
/// current sample.
pub struct PriceStabilityGate {
    settings: HashMap<String, PriceStabilityConfig>,
    data_freshness_seconds: f64,
    history: Mutex<HashMap<String, VecDeque<(Instant, f64, f64)>>>,
    throttle: StateThrottle,
}

impl PriceStabilityGate {
    pub fn new(config: &RuntimeConfig) -> Self {
        // Settings are compiled per monitored symbol up front so the hot
        // scan loop never consults the config maps.
        let settings = config
            .symbols
            .iter()
            .map(|s| (s.clone(), config.price_stability_for(s)))
            .collect();
        Self {
            settings,
            data_freshness_seconds: config.data_freshness_seconds,
            history: Mutex::new(HashMap::new()),
            throttle: StateThrottle::new(),
        }
    }

    fn settings_for(&self, symbol: &str) -> PriceStabilityConfig {
        self.settings.get(symbol).copied().unwrap_or_default()
    }

    /// Append one observation and trim history beyond the retention
    /// horizon.
    pub fn record_sample(&self, symbol: &str, buy_price: f64, sell_price: f64) {
        let cfg = self.settings_for(symbol);
        let mut map = self.history.lock();
        let history = map.entry(symbol.to_string()).or_default();
        let now = Instant::now();
        history.push_back((now, buy_price, sell_price));

        if cfg.window_seconds <= 0.0 {
            while history.len() > 60 {
                history.pop_front();
            }
            return;
        }

        let retention = (cfg.window_seconds + self.data_freshness_seconds * 2.0)
            .max(cfg.window_seconds * 4.0)
            .max(12.0);
        let cutoff = Duration::from_secs_f64(retention);
        while let Some((t, _, _)) = history.front() {
            if now.duration_since(*t) > cutoff {
                history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Evaluate the gate for `(symbol, action)`. Returns `true` when the
    /// window is covered and quiet.
    pub fn passes(&self, symbol: &str, action: &str) -> bool {
        let cfg = self.settings_for(symbol);
        let Some(threshold) = cfg.threshold_pct.filter(|t| *t > 0.0) else {
            return true;
        };
        if cfg.window_seconds <= 0.0 {
            return true;
        }

        let key = format!("{symbol}:{action}");
        let now = Instant::now();
        let mut map = self.history.lock();
        let Some(history) = map.get_mut(symbol).filter(|h| !h.is_empty()) else {
            drop(map);
            if self
                .throttle
                .should_log(&key, "collecting", THROTTLE_STABILITY_COLLECTING)
            {
                info!(symbol, action, window_s = cfg.window_seconds, "price stability: collecting");
            }
            return false;
        };

        let coverage = now.duration_since(history.front().expect("non-empty").0);
        if coverage.as_secs_f64() < cfg.window_seconds {
            drop(map);
            if self
                .throttle
                .should_log(&key, "collecting", THROTTLE_STABILITY_COLLECTING)
            {
                info!(
                    symbol,
                    action,
                    coverage_s = format!("{:.2}", coverage.as_secs_f64()),
                    window_s = cfg.window_seconds,
                    "price stability: observing window"
                );
            }
            return false;
        }

        let window = Duration::from_secs_f64(cfg.window_seconds);
        let relevant: Vec<(f64, f64)> = history
            .iter()
            .filter(|(t, _, _)| now.duration_since(*t) <= window)
            .map(|(_, b, s)| (*b, *s))
            .collect();
        let relevant = if relevant.is_empty() {
            let (_, b, s) = history.back().expect("non-empty");
            vec![(*b, *s)]
        } else {
            relevant
        };

        let volatility_buy = volatility_percent(relevant.iter().map(|(b, _)| *b));
        let volatility_sell = volatility_percent(relevant.iter().map(|(_, s)| *s));

        if volatility_buy > threshold || volatility_sell > threshold {
            // Reset the window to the breaching sample and start over.
            let last = *history.back().expect("non-empty");
            history.clear();
            history.push_back(last);
            drop(map);
            if self
                .throttle
                .should_log(&key, "volatile", THROTTLE_STABILITY_VOLATILE)
            {
                warn!(
                    symbol,
                    action,
                    volatility_buy = format!("{volatility_buy:.4}"),
                    volatility_sell = format!("{volatility_sell:.4}"),
                    threshold_pct = threshold,
                    "price stability: volatile, window restarted"
                );
            }
            return false;
        }

        drop(map);
        let was = self.throttle.state_of(&key);
        if self.throttle.should_log(&key, "ok", THROTTLE_STABILITY_VOLATILE)
            && was.as_deref() != Some("ok")
        {
            info!(
                symbol,
                action,
                volatility_buy = format!("{volatility_buy:.4}"),
                volatility_sell = format!("{volatility_sell:.4}"),
                threshold_pct = threshold,
                window_s = cfg.window_seconds,
                "price stability: ok"
            );
        }
        true
    }

    #[cfg(test)]
    fn backdate_history(&self, symbol: &str, age: Duration) {
        let mut map = self.history.lock();
        if let Some(history) = map.get_mut(symbol) {
            for entry in history.iter_mut() {
                entry.0 -= age;
            }
        }
    }
}

fn volatility_percent(values: impl Iterator<Item = f64>) -> f64 {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut any = false;
    for v in values {
        any = true;
        min = min.min(v);
        max = max.max(v);
    }
    if !any || min <= 0.0 {
        return 0.0;
    }
    (max - min) / min * 100.0
}

// ---------------------------------------------------------------------------
// Opposing-side liquidity
// ---------------------------------------------------------------------------

/// One leg to check against the fresh book.
#[derive(Debug, Clone)]
pub struct LiquidityLeg {
    pub venue: String,
    pub symbol: String,
    pub quantity: f64,
    pub is_buy: bool,
    pub min_required: Option<f64>,
    /// Human label for logs ("buy leg", "sell leg").
    pub desc: &'static str,
}

/// Why a leg failed the liquidity check.
#[derive(Debug, Clone, PartialEq)]
pub enum LiquidityFailure {
    BookMissing,
    NoDepth,
    Insufficient { available: f64, required: f64 },
}

pub struct LiquidityGate {
    aggregator: Arc<MarketDataAggregator>,
    max_age: Duration,
    leg_throttle: StateThrottle,
    aggregate_throttle: StateThrottle,
}

impl LiquidityGate {
    pub fn new(aggregator: Arc<MarketDataAggregator>, data_freshness_seconds: f64) -> Self {
        Self {
            aggregator,
            max_age: Duration::from_secs_f64(data_freshness_seconds),
            leg_throttle: StateThrottle::new(),
            aggregate_throttle: StateThrottle::new(),
        }
    }

    /// Check every leg. Returns the first failing leg, or `None` when all
    /// pass. A leg whose book carries no size field is skipped (unknowable).
    pub fn verify(
        &self,
        symbol: &str,
        action: &str,
        legs: &[LiquidityLeg],
    ) -> Option<(LiquidityLeg, LiquidityFailure)> {
        for leg in legs {
            let outcome = self.check_leg(leg);
            let log_key = format!("{action}:{symbol}:{}:{}:{}", leg.venue, leg.symbol, leg.desc);
            match outcome {
                CheckOutcome::Skipped => {
                    self.leg_throttle.clear(&log_key);
                }
                CheckOutcome::Ok { available } => {
                    if self.should_log_leg(symbol, action, &log_key, "ok", THROTTLE_LIQUIDITY_OK) {
                        info!(
                            action,
                            symbol,
                            desc = leg.desc,
                            venue = %leg.venue,
                            quantity = leg.quantity,
                            available,
                            "liquidity check passed"
                        );
                    }
                }
                CheckOutcome::Failed(failure) => {
                    if self.should_log_leg(
                        symbol,
                        action,
                        &log_key,
                        "insufficient",
                        THROTTLE_LIQUIDITY_INSUFFICIENT,
                    ) {
                        warn!(
                            action,
                            symbol,
                            desc = leg.desc,
                            venue = %leg.venue,
                            quantity = leg.quantity,
                            failure = ?failure,
                            "liquidity check failed"
                        );
                    }
                    return Some((leg.clone(), failure));
                }
            }
        }
        None
    }

    /// Per-leg throttle plus a per-(symbol, action) aggregate so multiple
    /// legs cannot storm together.
    fn should_log_leg(
        &self,
        symbol: &str,
        action: &str,
        log_key: &str,
        state: &str,
        interval: Duration,
    ) -> bool {
        if !self.leg_throttle.should_log(log_key, state, interval) {
            return false;
        }
        let aggregate_key = format!("{action}:{symbol}");
        self.aggregate_throttle
            .should_log(&aggregate_key, state, THROTTLE_LIQUIDITY_AGGREGATE)
    }

    fn check_leg(&self, leg: &LiquidityLeg) -> CheckOutcome {
        let Some(book) = self
            .aggregator
            .get_book(&leg.venue, &leg.symbol, self.max_age)
        else {
            return CheckOutcome::Failed(LiquidityFailure::BookMissing);
        };
        // A buy consumes the ask side; a sell consumes the bid side.
        let level = if leg.is_buy {
            book.best_ask
        } else {
            book.best_bid
        };
        let Some(level) = level else {
            return CheckOutcome::Failed(LiquidityFailure::NoDepth);
        };
        let Some(available) = level.size else {
            // Venue publishes no size: unknowable, skip the check.
            return CheckOutcome::Skipped;
        };
        if available <= 0.0 {
            return CheckOutcome::Failed(LiquidityFailure::Insufficient {
                available,
                required: leg.quantity,
            });
        }
        let required = leg.min_required.map_or(leg.quantity, |m| m.max(leg.quantity));
        if available + QTY_EPSILON < required {
            return CheckOutcome::Failed(LiquidityFailure::Insufficient {
                available,
                required,
            });
        }
        CheckOutcome::Ok { available }
    }
}

enum CheckOutcome {
    Ok { available: f64 },
    Failed(LiquidityFailure),
    Skipped,
}

// ---------------------------------------------------------------------------
// Dual-limit backoff
// ---------------------------------------------------------------------------

/// When both limit legs of an attempt expire unfilled, the symbol backs off
/// before re-evaluation; the delay doubles per consecutive failure up to a
/// cap, and a successful attempt clears it.
pub struct DualLimitBackoff {
    initial_delay: f64,
    max_delay: f64,
    backoff_factor: f64,
    state: Mutex<HashMap<String, BackoffEntry>>,
}

struct BackoffEntry {
    current_delay: f64,
    next_eligible: Instant,
}

impl DualLimitBackoff {
    pub fn new(config: &OrderExecutionConfig) -> Self {
        let initial = config.dual_limit_retry_initial_delay.max(1.0);
        Self {
            initial_delay: initial,
            max_delay: config.dual_limit_retry_max_delay.max(initial),
            backoff_factor: config.dual_limit_retry_backoff_factor.max(1.0),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// `true` while the symbol is inside its backoff window. An expired
    /// window is removed on query.
    pub fn should_skip(&self, symbol: &str) -> bool {
        let mut map = self.state.lock();
        let Some(entry) = map.get(symbol) else {
            return false;
        };
        let now = Instant::now();
        if now >= entry.next_eligible {
            map.remove(symbol);
            return false;
        }
        let remaining = entry.next_eligible - now;
        info!(
            symbol,
            remaining_s = format!("{:.1}", remaining.as_secs_f64()),
            current_delay_s = entry.current_delay,
            "dual-limit backoff active, skipping"
        );
        true
    }

    /// Record a failed dual-limit attempt and extend the delay.
    pub fn schedule(&self, symbol: &str) {
        let mut map = self.state.lock();
        let previous = map.get(symbol).map(|e| e.current_delay).unwrap_or(0.0);
        let next_delay = if previous <= 0.0 {
            self.initial_delay
        } else {
            (previous * self.backoff_factor).min(self.max_delay)
        };
        map.insert(
            symbol.to_string(),
            BackoffEntry {
                current_delay: next_delay,
                next_eligible: Instant::now() + Duration::from_secs_f64(next_delay),
            },
        );
        warn!(
            symbol,
            delay_s = next_delay,
            "dual-limit legs unfilled, backing off"
        );
    }

    pub fn clear(&self, symbol: &str) {
        self.state.lock().remove(symbol);
    }

    #[cfg(test)]
    fn force_eligible(&self, symbol: &str) {
        if let Some(entry) = self.state.lock().get_mut(symbol) {
            entry.next_eligible = Instant::now();
        }
    }

    #[cfg(test)]
    fn current_delay(&self, symbol: &str) -> Option<f64> {
        self.state.lock().get(symbol).map(|e| e.current_delay)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrage::detector::DetectorConfig;
    use crate::types::{BookLevel, OrderBookTop};

    fn config_with_stability(window: f64, threshold: Option<f64>) -> RuntimeConfig {
        let mut cfg = RuntimeConfig::default();
        cfg.symbols = vec!["BTC-USDC-PERP".to_string()];
        cfg.price_stability.insert(
            "BTC-USDC-PERP".into(),
            PriceStabilityConfig {
                window_seconds: window,
                threshold_pct: threshold,
            },
        );
        cfg
    }

    #[test]
    fn disabled_stability_gate_always_passes() {
        let gate = PriceStabilityGate::new(&config_with_stability(0.0, Some(0.1)));
        assert!(gate.passes("BTC-USDC-PERP", "open"));
        let gate = PriceStabilityGate::new(&config_with_stability(5.0, None));
        assert!(gate.passes("BTC-USDC-PERP", "open"));
    }

    #[test]
    fn stability_reports_collecting_until_window_covered() {
        let gate = PriceStabilityGate::new(&config_with_stability(5.0, Some(0.1)));
        assert!(!gate.passes("BTC-USDC-PERP", "open"));
        gate.record_sample("BTC-USDC-PERP", 100.0, 100.5);
        assert!(!gate.passes("BTC-USDC-PERP", "open"));
    }

    #[test]
    fn stability_passes_on_quiet_covered_window() {
        let gate = PriceStabilityGate::new(&config_with_stability(5.0, Some(0.1)));
        gate.record_sample("BTC-USDC-PERP", 100.0, 100.5);
        gate.record_sample("BTC-USDC-PERP", 100.01, 100.51);
        // Age the samples so the window reads as covered.
        gate.backdate_history("BTC-USDC-PERP", Duration::from_secs(6));
        gate.record_sample("BTC-USDC-PERP", 100.02, 100.52);
        assert!(gate.passes("BTC-USDC-PERP", "open"));
    }

    #[test]
    fn stability_resets_on_volatile_sample() {
        let gate = PriceStabilityGate::new(&config_with_stability(5.0, Some(0.1)));
        gate.record_sample("BTC-USDC-PERP", 100.0, 100.5);
        gate.backdate_history("BTC-USDC-PERP", Duration::from_secs(4));
        gate.record_sample("BTC-USDC-PERP", 101.0, 101.5);
        gate.backdate_history("BTC-USDC-PERP", Duration::from_secs(2));
        // Last two samples sit inside the window and differ by ~1%, well
        // past the 0.1% threshold.
        gate.record_sample("BTC-USDC-PERP", 102.0, 102.5);
        assert!(!gate.passes("BTC-USDC-PERP", "open"));
        // History restarted from the breaching sample: collecting again.
        assert!(!gate.passes("BTC-USDC-PERP", "open"));
    }

    fn aggregator_with_book(size: Option<f64>) -> Arc<MarketDataAggregator> {
        let agg = MarketDataAggregator::new(
            vec!["BTC-USDC-PERP".to_string()],
            DetectorConfig {
                price_spread_threshold: 0.1,
                funding_rate_threshold: 0.0001,
            },
        );
        let cb = agg.book_callback("lighter");
        cb(OrderBookTop {
            symbol: "BTC-USDC-PERP".into(),
            best_bid: Some(BookLevel {
                price: 99.9,
                size,
            }),
            best_ask: Some(BookLevel {
                price: 100.0,
                size,
            }),
            event_time: None,
        });
        agg
    }

    fn leg(quantity: f64, min_required: Option<f64>) -> LiquidityLeg {
        LiquidityLeg {
            venue: "lighter".into(),
            symbol: "BTC-USDC-PERP".into(),
            quantity,
            is_buy: true,
            min_required,
            desc: "buy leg",
        }
    }

    #[tokio::test]
    async fn liquidity_requires_fresh_book() {
        let agg = aggregator_with_book(Some(5.0));
        // Nothing was processed into the cache yet (event still queued), so
        // the book is missing from the gate's perspective.
        let gate = LiquidityGate::new(agg, 5.0);
        let failure = gate.verify("BTC-USDC-PERP", "open", &[leg(1.0, None)]);
        assert!(matches!(
            failure,
            Some((_, LiquidityFailure::BookMissing))
        ));
    }

    #[tokio::test]
    async fn liquidity_checks_against_opposing_top() {
        let agg = aggregator_with_book(Some(5.0));
        let handles = agg.spawn_workers();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let gate = LiquidityGate::new(agg, 5.0);
        assert!(gate.verify("BTC-USDC-PERP", "open", &[leg(5.0, None)]).is_none());
        let failure = gate.verify("BTC-USDC-PERP", "open", &[leg(5.1, None)]);
        assert!(matches!(
            failure,
            Some((_, LiquidityFailure::Insufficient { .. }))
        ));
        // min_required dominates the requested quantity.
        let failure = gate.verify("BTC-USDC-PERP", "open", &[leg(1.0, Some(6.0))]);
        assert!(failure.is_some());
        for h in handles {
            h.abort();
        }
    }

    #[tokio::test]
    async fn liquidity_skips_sizeless_books() {
        let agg = aggregator_with_book(None);
        let handles = agg.spawn_workers();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let gate = LiquidityGate::new(agg, 5.0);
        // Size is unknowable: the check is skipped, not failed.
        assert!(gate
            .verify("BTC-USDC-PERP", "open", &[leg(1000.0, None)])
            .is_none());
        for h in handles {
            h.abort();
        }
    }

    #[test]
    fn dual_limit_backoff_doubles_to_cap_and_clears() {
        let cfg = OrderExecutionConfig {
            dual_limit_retry_initial_delay: 30.0,
            dual_limit_retry_max_delay: 100.0,
            dual_limit_retry_backoff_factor: 2.0,
            ..Default::default()
        };
        let backoff = DualLimitBackoff::new(&cfg);
        assert!(!backoff.should_skip("BTC-USDC-PERP"));

        backoff.schedule("BTC-USDC-PERP");
        assert_eq!(backoff.current_delay("BTC-USDC-PERP"), Some(30.0));
        assert!(backoff.should_skip("BTC-USDC-PERP"));

        backoff.schedule("BTC-USDC-PERP");
        assert_eq!(backoff.current_delay("BTC-USDC-PERP"), Some(60.0));
        backoff.schedule("BTC-USDC-PERP");
        assert_eq!(backoff.current_delay("BTC-USDC-PERP"), Some(100.0));

        backoff.clear("BTC-USDC-PERP");
        assert!(!backoff.should_skip("BTC-USDC-PERP"));
    }

    #[test]
    fn expired_backoff_window_reopens() {
        let backoff = DualLimitBackoff::new(&OrderExecutionConfig::default());
        backoff.schedule("ETH-USDC-PERP");
        assert!(backoff.should_skip("ETH-USDC-PERP"));
        backoff.force_eligible("ETH-USDC-PERP");
        assert!(!backoff.should_skip("ETH-USDC-PERP"));
        // Entry removed after expiry; next failure restarts at the initial
        // delay.
        backoff.schedule("ETH-USDC-PERP");
        assert_eq!(backoff.current_delay("ETH-USDC-PERP"), Some(30.0));
    }
}
