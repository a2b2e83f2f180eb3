// =============================================================================
// Connection Health Monitor — staleness sweeps and majority-failure reconnect
// =============================================================================
//
// Every check interval (after a startup grace), each venue's monitored
// symbols are tested for staleness. When more than half are stale the
// venue's WebSocket is torn down and re-established with its full
// subscription set; attempts are bounded, and exhaustion leaves the venue
// degraded for a human. A periodic report summarizes per-venue health.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::adapters::ExchangeAdapter;
use crate::config::HealthConfig;
use crate::market_data::MarketDataAggregator;
use crate::util::reconnect::ReconnectPolicy;

/// Stale-symbol ratio above which a reconnect triggers (exclusive).
const RECONNECT_RATIO: f64 = 0.5;

/// Per-venue health snapshot for the statistics surface.
#[derive(Debug, Clone, Serialize)]
pub struct VenueHealth {
    pub venue: String,
    pub healthy_symbols: usize,
    pub total_symbols: usize,
    pub health_ratio: f64,
    pub reconnect_count: u64,
    pub is_reconnecting: bool,
    /// healthy (>= 0.8), degraded (>= 0.5), unhealthy, or reconnecting.
    pub status: &'static str,
}

pub struct HealthMonitor {
    adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
    aggregator: Arc<MarketDataAggregator>,
    config: HealthConfig,
    policy: ReconnectPolicy,
    started_at: Instant,
    reconnecting: Mutex<HashSet<String>>,
    attempts: Mutex<HashMap<String, u32>>,
    total_reconnects: Mutex<HashMap<String, u64>>,
    last_report: Mutex<Instant>,
}

impl HealthMonitor {
    pub fn new(
        adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
        aggregator: Arc<MarketDataAggregator>,
        config: HealthConfig,
    ) -> Arc<Self> {
        let policy = if config.unbounded_reconnect {
            ReconnectPolicy::unbounded()
        } else {
            ReconnectPolicy::bounded(config.max_reconnect_attempts)
        };
        Arc::new(Self {
            adapters,
            aggregator,
            config,
            policy,
            started_at: Instant::now(),
            reconnecting: Mutex::new(HashSet::new()),
            attempts: Mutex::new(HashMap::new()),
            total_reconnects: Mutex::new(HashMap::new()),
            last_report: Mutex::new(Instant::now()),
        })
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                check_interval_s = self.config.check_interval_seconds,
                startup_grace_s = self.config.startup_grace_seconds,
                "health monitor started"
            );
            let mut interval =
                tokio::time::interval(Duration::from_secs(self.config.check_interval_seconds));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                self.run_check();
            }
        })
    }

    /// One sweep over every venue. Public for tests.
    pub fn run_check(self: &Arc<Self>) {
        // No checks during the startup grace: feeds need time to produce
        // their first samples.
        let elapsed = self.started_at.elapsed();
        if elapsed < Duration::from_secs(self.config.startup_grace_seconds) {
            return;
        }

        let timeout = Duration::from_secs(self.config.data_timeout_seconds);
        let symbols = self.aggregator.universe().to_vec();

        for (venue, adapter) in &self.adapters {
            if self.reconnecting.lock().contains(venue) {
                continue;
            }
            let attempts_so_far = *self.attempts.lock().get(venue).unwrap_or(&0);
            if !self.config.unbounded_reconnect
                && attempts_so_far >= self.config.max_reconnect_attempts
            {
                // Exhausted: degraded until someone intervenes.
                continue;
            }

            let stale = symbols
                .iter()
                .filter(|s| self.aggregator.is_stale(venue, s, timeout))
                .count();
            let total = symbols.len();
            let ratio = if total > 0 {
                stale as f64 / total as f64
            } else {
                0.0
            };

            if ratio > RECONNECT_RATIO {
                warn!(
                    venue = %venue,
                    stale,
                    total,
                    ratio = format!("{:.0}%", ratio * 100.0),
                    "majority of symbols stale, reconnecting venue"
                );
                self.reconnecting.lock().insert(venue.clone());
                let monitor = self.clone();
                let venue = venue.clone();
                let adapter = adapter.clone();
                tokio::spawn(async move {
                    monitor.reconnect_venue(&venue, adapter).await;
                });
            } else if attempts_so_far > 0 {
                // Data is flowing again: the attempt budget refills.
                self.attempts.lock().insert(venue.clone(), 0);
            }
        }

        // Periodic health report.
        let report_due = {
            let mut last = self.last_report.lock();
            if last.elapsed() >= Duration::from_secs(self.config.health_check_log_interval) {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if report_due {
            self.log_health_report(&symbols, timeout);
        }
    }

    async fn reconnect_venue(self: &Arc<Self>, venue: &str, adapter: Arc<dyn ExchangeAdapter>) {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let counter = attempts.entry(venue.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        *self
            .total_reconnects
            .lock()
            .entry(venue.to_string())
            .or_insert(0) += 1;

        info!(
            venue,
            attempt,
            max = self.config.max_reconnect_attempts,
            "reconnect starting"
        );

        if let Err(e) = adapter.disconnect().await {
            warn!(venue, error = %e, "disconnect before reconnect failed");
        }

        let delay = self
            .policy
            .delay_for_attempt(attempt)
            .unwrap_or(Duration::from_secs(30));
        info!(venue, wait_s = delay.as_secs(), "waiting before reconnect");
        tokio::time::sleep(delay).await;

        match adapter.connect().await {
            Ok(()) => {
                if let Err(e) =
                    apply_market_subscriptions(&adapter, &self.aggregator, venue).await
                {
                    error!(venue, error = %e, "re-subscription after reconnect failed");
                } else {
                    info!(
                        venue,
                        symbols = self.aggregator.universe().len(),
                        "reconnect complete, subscriptions restored"
                    );
                }
            }
            Err(e) => {
                error!(venue, attempt, error = %e, "reconnect failed");
                if !self.config.unbounded_reconnect
                    && attempt >= self.config.max_reconnect_attempts
                {
                    error!(
                        venue,
                        "reconnect attempts exhausted, venue left degraded until manual intervention"
                    );
                }
            }
        }
        self.reconnecting.lock().remove(venue);
    }

    fn log_health_report(&self, symbols: &[String], timeout: Duration) {
        for venue in self.adapters.keys() {
            let mut stale = 0usize;
            let mut min_age: Option<f64> = None;
            let mut max_age: Option<f64> = None;
            for symbol in symbols {
                if self.aggregator.is_stale(venue, symbol, timeout) {
                    stale += 1;
                }
                if let Some(age) = self.aggregator.staleness_seconds(venue, symbol) {
                    min_age = Some(min_age.map_or(age, |m| m.min(age)));
                    max_age = Some(max_age.map_or(age, |m| m.max(age)));
                }
            }
            let reconnects = *self.total_reconnects.lock().get(venue).unwrap_or(&0);
            info!(
                venue = %venue,
                healthy = symbols.len() - stale,
                total = symbols.len(),
                min_staleness_s = min_age.map(|a| format!("{a:.0}")).unwrap_or_else(|| "-".into()),
                max_staleness_s = max_age.map(|a| format!("{a:.0}")).unwrap_or_else(|| "-".into()),
                reconnects,
                "venue health report"
            );
        }
    }

    /// Per-venue health for the UI surface, with 0.8 / 0.5 status banding.
    pub fn statistics(&self) -> Vec<VenueHealth> {
        let timeout = Duration::from_secs(self.config.data_timeout_seconds);
        let symbols = self.aggregator.universe();
        let mut out = Vec::with_capacity(self.adapters.len());
        for venue in self.adapters.keys() {
            let healthy = symbols
                .iter()
                .filter(|s| !self.aggregator.is_stale(venue, s, timeout))
                .count();
            let total = symbols.len();
            let ratio = if total > 0 {
                healthy as f64 / total as f64
            } else {
                0.0
            };
            let is_reconnecting = self.reconnecting.lock().contains(venue);
            out.push(VenueHealth {
                venue: venue.clone(),
                healthy_symbols: healthy,
                total_symbols: total,
                health_ratio: ratio,
                reconnect_count: *self.total_reconnects.lock().get(venue).unwrap_or(&0),
                is_reconnecting,
                status: if is_reconnecting {
                    "reconnecting"
                } else if ratio >= 0.8 {
                    "healthy"
                } else if ratio >= 0.5 {
                    "degraded"
                } else {
                    "unhealthy"
                },
            });
        }
        out.sort_by(|a, b| a.venue.cmp(&b.venue));
        out
    }
}

/// Apply a venue's full market subscription set: every monitored symbol's
/// book and ticker, with the aggregator's ingest callbacks. On venues with
/// a single unified push callback, the callback registers once and later
/// symbols subscribe with `None`.
pub async fn apply_market_subscriptions(
    adapter: &Arc<dyn ExchangeAdapter>,
    aggregator: &Arc<MarketDataAggregator>,
    venue: &str,
) -> crate::error::ExchangeResult<()> {
    let unified = adapter.uses_unified_stream_callbacks();
    for (idx, symbol) in aggregator.universe().iter().enumerate() {
        let book_cb = if !unified || idx == 0 {
            Some(aggregator.book_callback(venue))
        } else {
            None
        };
        let ticker_cb = if !unified || idx == 0 {
            Some(aggregator.ticker_callback(venue))
        } else {
            None
        };
        if let Err(e) = adapter.subscribe_orderbook(symbol, book_cb).await {
            warn!(venue, symbol = %symbol, error = %e, "book subscription failed");
        }
        if let Err(e) = adapter.subscribe_ticker(symbol, ticker_cb).await {
            warn!(venue, symbol = %symbol, error = %e, "ticker subscription failed");
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrage::detector::DetectorConfig;

    fn monitor_with(symbol_count: usize) -> (Arc<HealthMonitor>, Arc<MarketDataAggregator>) {
        let universe: Vec<String> = (0..symbol_count)
            .map(|i| format!("SYM{i}-USDC-PERP"))
            .collect();
        let aggregator = MarketDataAggregator::new(
            universe,
            DetectorConfig {
                price_spread_threshold: 0.1,
                funding_rate_threshold: 0.0001,
            },
        );
        let monitor = HealthMonitor::new(HashMap::new(), aggregator.clone(), HealthConfig::default());
        (monitor, aggregator)
    }

    #[test]
    fn ratio_boundary_is_strictly_greater_than_half() {
        // 5 of 10 stale: ratio = 0.5, must NOT trigger; 6 of 10 must.
        assert!(!(0.5f64 > RECONNECT_RATIO));
        assert!(0.6f64 > RECONNECT_RATIO);
    }

    #[tokio::test]
    async fn statistics_band_by_health_ratio() {
        let (monitor, aggregator) = monitor_with(10);
        // No data at all: every symbol stale; with no adapters registered
        // the statistics list is empty.
        assert!(monitor.statistics().is_empty());
        // The aggregator still answers staleness for unknown venues.
        assert!(aggregator.is_stale("backpack", "SYM0-USDC-PERP", Duration::from_secs(90)));
    }

    #[tokio::test]
    async fn startup_grace_suppresses_checks() {
        let (monitor, _) = monitor_with(3);
        // Freshly created: inside the 120 s grace, the sweep is a no-op and
        // must not mark anything reconnecting.
        monitor.run_check();
        assert!(monitor.reconnecting.lock().is_empty());
    }
}
