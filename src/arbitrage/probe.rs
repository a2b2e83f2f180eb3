// =============================================================================
// Reduce-Only Probe Scheduler — hourly :00:05 probe loop
// =============================================================================
//
// Pairs flagged by a reduce-only rejection sit in WAITING until a probe
// order is accepted. One loop wakes at each wall-clock hour + 5 seconds,
// submits a minimum-quantity far-from-market order per flagged leg, and
// resumes the pair on the first acceptance. A pair whose probes all fail
// stays flagged until the next hour.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Timelike, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::arbitrage::executor::TwoLegExecutor;
use crate::arbitrage::quarantine::{ProbeRecord, QuarantineManager, ReduceOnlyGuard};

/// Seconds past the hour at which probes fire.
const PROBE_SECOND: u32 = 5;

pub struct ReduceOnlyProbeService {
    executor: Arc<TwoLegExecutor>,
    guard: Arc<ReduceOnlyGuard>,
    quarantine: Arc<QuarantineManager>,
    probe_quantity: f64,
    probe_price: f64,
    timezone: FixedOffset,
}

impl ReduceOnlyProbeService {
    pub fn new(
        executor: Arc<TwoLegExecutor>,
        guard: Arc<ReduceOnlyGuard>,
        quarantine: Arc<QuarantineManager>,
        probe_quantity: f64,
        probe_price: f64,
        timezone_offset_hours: i32,
    ) -> Self {
        let timezone = FixedOffset::east_opt(timezone_offset_hours * 3600)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("UTC offset"));
        Self {
            executor,
            guard,
            quarantine,
            probe_quantity,
            probe_price,
            timezone,
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("reduce-only probe scheduler started");
            loop {
                let wait = self.delay_until_next_probe(Utc::now());
                tokio::time::sleep(wait).await;
                self.run_probes().await;
            }
        })
    }

    /// Time until the next hour-boundary + 5 s wake in the configured
    /// timezone, never less than half a second.
    fn delay_until_next_probe(&self, now: DateTime<Utc>) -> Duration {
        let local = now.with_timezone(&self.timezone);
        let candidate = local
            .with_minute(0)
            .and_then(|t| t.with_second(PROBE_SECOND))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(local);
        let next = if local >= candidate {
            candidate + ChronoDuration::hours(1)
        } else {
            candidate
        };
        let wait = (next - local)
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        wait.max(Duration::from_millis(500))
    }

    /// One probe round over every flagged pair.
    pub async fn run_probes(&self) {
        let blocked = self.guard.list_blocked_pairs();
        if blocked.is_empty() {
            return;
        }
        info!(
            pairs = blocked.len(),
            "running reduce-only probes on flagged pairs"
        );

        for state in blocked {
            let mut restored = false;
            for (venue, leg_symbol) in &state.legs {
                let success = self
                    .executor
                    .probe_reduce_only_leg(venue, leg_symbol, self.probe_quantity, self.probe_price)
                    .await;
                self.quarantine.record_probe(
                    &state.pair_id,
                    ProbeRecord {
                        venue: venue.clone(),
                        symbol: leg_symbol.clone(),
                        success,
                        at: Utc::now(),
                    },
                );
                if success {
                    info!(
                        pair = %state.pair_id,
                        venue = %venue,
                        "probe accepted, resuming pair"
                    );
                    self.guard.clear(&state.pair_id);
                    self.quarantine
                        .resume(&state.pair_id, "reduce-only probe accepted");
                    restored = true;
                    break;
                }
                info!(
                    pair = %state.pair_id,
                    venue = %venue,
                    "probe still restricted, waiting for next hour"
                );
            }
            if !restored {
                error!(
                    pair = %state.pair_id,
                    "pair remains reduce-only restricted after probing"
                );
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn service_with_offset(hours: i32) -> ReduceOnlyProbeService {
        use crate::arbitrage::detector::DetectorConfig;
        use crate::arbitrage::executor::OrderTracker;
        use crate::config::OrderExecutionConfig;
        use crate::market_data::MarketDataAggregator;
        use std::collections::HashMap;

        let aggregator = MarketDataAggregator::new(
            vec![],
            DetectorConfig {
                price_spread_threshold: 0.1,
                funding_rate_threshold: 0.0001,
            },
        );
        let quarantine = Arc::new(QuarantineManager::new());
        let guard = Arc::new(ReduceOnlyGuard::new());
        let executor = Arc::new(TwoLegExecutor::new(
            HashMap::new(),
            aggregator,
            OrderTracker::new(),
            quarantine.clone(),
            guard.clone(),
            OrderExecutionConfig::default(),
            5.0,
        ));
        ReduceOnlyProbeService::new(executor, guard, quarantine, 0.001, 2000.0, hours)
    }

    #[test]
    fn wakes_at_next_hour_plus_five_seconds() {
        let service = service_with_offset(0);
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 14, 30, 0).unwrap();
        let wait = service.delay_until_next_probe(now);
        // 15:00:05 is 30 minutes and 5 seconds away.
        assert_eq!(wait, Duration::from_secs(30 * 60 + 5));
    }

    #[test]
    fn before_the_five_second_mark_fires_same_hour() {
        let service = service_with_offset(0);
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 14, 0, 2).unwrap();
        let wait = service.delay_until_next_probe(now);
        assert_eq!(wait, Duration::from_secs(3));
    }

    #[test]
    fn exactly_on_the_mark_waits_a_full_hour() {
        let service = service_with_offset(0);
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 14, 0, 5).unwrap();
        let wait = service.delay_until_next_probe(now);
        assert_eq!(wait, Duration::from_secs(3600));
    }

    #[test]
    fn whole_hour_offsets_share_the_boundary() {
        // Hour boundaries coincide for whole-hour offsets, so the delay is
        // identical; the knob matters for operators in half-hour zones who
        // configure their own offset.
        let utc = service_with_offset(0);
        let tokyo = service_with_offset(9);
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 14, 42, 11).unwrap();
        assert_eq!(
            utc.delay_until_next_probe(now),
            tokyo.delay_until_next_probe(now)
        );
    }

    #[tokio::test]
    async fn probe_round_with_no_flagged_pairs_is_a_noop() {
        let service = service_with_offset(0);
        service.run_probes().await;
        assert!(service.guard.list_blocked_pairs().is_empty());
    }
}
