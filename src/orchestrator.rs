// =============================================================================
// Unified Orchestrator — owns every long-running task and the scan loop
// =============================================================================
//
// Start order: adapters connect/authenticate -> market subscriptions ->
// aggregator workers -> health monitor -> probe scheduler -> scan loop.
// Stop reverses it: tasks are aborted newest-first and the adapters
// disconnect last. Nothing survives this struct; there are no orphan tasks.
//
// The scan loop consumes the aggregator's result queue. For each top
// opportunity: quarantine check, dual-limit backoff, price-stability gate,
// opposing-liquidity gate, then the executor.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::adapters::backpack::BackpackAdapter;
use crate::adapters::grvt::GrvtAdapter;
use crate::adapters::lighter::LighterAdapter;
use crate::adapters::ExchangeAdapter;
use crate::arbitrage::detector::DetectorConfig;
use crate::arbitrage::executor::{
    ExecutionOutcome, ExecutionRequest, OrderTracker, TwoLegExecutor,
};
use crate::arbitrage::models::ArbitrageOpportunity;
use crate::arbitrage::probe::ReduceOnlyProbeService;
use crate::arbitrage::quarantine::{grid_level, QuarantineManager, QuarantineState, ReduceOnlyGuard};
use crate::arbitrage::risk::{DualLimitBackoff, LiquidityGate, LiquidityLeg, PriceStabilityGate};
use crate::config::RuntimeConfig;
use crate::health::{apply_market_subscriptions, HealthMonitor, VenueHealth};
use crate::market_data::{AggregatorMetrics, MarketDataAggregator};

/// Engine-wide status snapshot exposed to the UI layer.
#[derive(Debug, Serialize)]
pub struct EngineStatistics {
    pub running: bool,
    pub monitored_symbols: usize,
    pub venues: Vec<VenueHealth>,
    pub quarantined: HashMap<String, QuarantineState>,
    pub pending_orders: usize,
    #[serde(skip)]
    pub aggregator: AggregatorMetrics,
}

pub struct UnifiedOrchestrator {
    config: RuntimeConfig,
    adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
    aggregator: Arc<MarketDataAggregator>,
    tracker: Arc<OrderTracker>,
    executor: Arc<TwoLegExecutor>,
    quarantine: Arc<QuarantineManager>,
    stability: Arc<PriceStabilityGate>,
    liquidity: Arc<LiquidityGate>,
    dual_limit_backoff: Arc<DualLimitBackoff>,
    health: Arc<HealthMonitor>,
    probe: Arc<ReduceOnlyProbeService>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl UnifiedOrchestrator {
    /// Wire every subsystem from the runtime config. Venues appear only if
    /// their credential block exists in the config.
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let balance_ttl = Duration::from_secs(config.balance_cache_ttl);
        let market_timeout =
            Duration::from_secs(config.order_execution.lighter_market_order_timeout);

        let mut adapters: HashMap<String, Arc<dyn ExchangeAdapter>> = HashMap::new();
        if let Some(venue_cfg) = config.venues.get("backpack") {
            adapters.insert(
                "backpack".into(),
                Arc::new(BackpackAdapter::new(venue_cfg, balance_ttl)),
            );
        }
        if let Some(venue_cfg) = config.venues.get("grvt") {
            adapters.insert("grvt".into(), Arc::new(GrvtAdapter::new(venue_cfg, balance_ttl)));
        }
        if let Some(venue_cfg) = config.venues.get("lighter") {
            adapters.insert(
                "lighter".into(),
                Arc::new(LighterAdapter::new(
                    venue_cfg,
                    &config.symbols,
                    balance_ttl,
                    market_timeout,
                )),
            );
        }

        let aggregator = MarketDataAggregator::new(
            config.symbols.clone(),
            DetectorConfig {
                price_spread_threshold: config.price_spread_threshold,
                funding_rate_threshold: config.funding_rate_threshold,
            },
        );
        let tracker = OrderTracker::new();
        let quarantine = Arc::new(QuarantineManager::new());
        let reduce_only_guard = Arc::new(ReduceOnlyGuard::new());

        let executor = Arc::new(TwoLegExecutor::new(
            adapters.clone(),
            aggregator.clone(),
            tracker.clone(),
            quarantine.clone(),
            reduce_only_guard.clone(),
            config.order_execution.clone(),
            config.data_freshness_seconds,
        ));

        let stability = Arc::new(PriceStabilityGate::new(&config));
        let liquidity = Arc::new(LiquidityGate::new(
            aggregator.clone(),
            config.data_freshness_seconds,
        ));
        let dual_limit_backoff = Arc::new(DualLimitBackoff::new(&config.order_execution));

        let health = HealthMonitor::new(adapters.clone(), aggregator.clone(), config.health.clone());
        let probe = Arc::new(ReduceOnlyProbeService::new(
            executor.clone(),
            reduce_only_guard,
            quarantine.clone(),
            config.order_execution.probe_quantity,
            config.order_execution.probe_price,
            config.probe_timezone_offset_hours,
        ));

        Arc::new(Self {
            config,
            adapters,
            aggregator,
            tracker,
            executor,
            quarantine,
            stability,
            liquidity,
            dual_limit_backoff,
            health,
            probe,
            tasks: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("orchestrator already running");
            return Ok(());
        }
        info!(
            venues = self.adapters.len(),
            symbols = self.config.symbols.len(),
            "starting orchestrator"
        );

        // 1. Connect venues and authenticate where credentials allow.
        for (venue, adapter) in &self.adapters {
            adapter
                .connect()
                .await
                .map_err(|e| anyhow::anyhow!("{venue} connect failed: {e}"))?;
            if let Err(e) = adapter.authenticate().await {
                warn!(venue = %venue, error = %e, "authentication failed, venue is market-data only");
            }
        }

        // 2. Market-data subscriptions with the aggregator's callbacks.
        for (venue, adapter) in &self.adapters {
            apply_market_subscriptions(adapter, &self.aggregator, venue).await?;
        }

        // 3. Order push streams feed the executor's tracker. Venues without
        //    a private stream fall back to REST polling inside the fill
        //    waits.
        for (venue, adapter) in &self.adapters {
            if let Err(e) = adapter.subscribe_user_data(self.tracker.order_callback()).await {
                warn!(venue = %venue, error = %e, "no user-data stream, fills tracked via REST polling");
            }
        }

        // 4. Long-running tasks (stop() aborts in reverse order).
        let mut tasks = self.tasks.lock();
        tasks.extend(self.aggregator.spawn_workers());
        tasks.push(self.health.clone().spawn());
        tasks.push(self.probe.clone().spawn());
        tasks.push(self.clone().spawn_scan_loop());
        info!(tasks = tasks.len(), "orchestrator started");
        Ok(())
    }

    pub async fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping orchestrator");

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks.into_iter().rev() {
            task.abort();
            let _ = task.await;
        }

        for (venue, adapter) in &self.adapters {
            if let Err(e) = adapter.disconnect().await {
                warn!(venue = %venue, error = %e, "disconnect failed during shutdown");
            }
        }
        info!("orchestrator stopped");
    }

    // -------------------------------------------------------------------------
    // Scan loop
    // -------------------------------------------------------------------------

    fn spawn_scan_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("scan loop started");
            while self.running.load(Ordering::Relaxed) {
                let results = self.aggregator.next_results().await;
                if let Some(opportunity) = self.pick_candidate(&results) {
                    self.handle_opportunity(&opportunity).await;
                }
            }
        })
    }

    /// The best price-bearing opportunity above the score threshold, if
    /// any. Results arrive sorted by score descending.
    fn pick_candidate(&self, results: &[ArbitrageOpportunity]) -> Option<ArbitrageOpportunity> {
        results
            .iter()
            .find(|o| o.price_spread.is_some() && o.is_profitable(self.config.min_score_threshold))
            .cloned()
    }

    async fn handle_opportunity(&self, opportunity: &ArbitrageOpportunity) {
        let Some(spread) = &opportunity.price_spread else {
            return;
        };
        let symbol = &opportunity.symbol;
        let current_grid = grid_level(spread.spread_pct, self.config.price_spread_threshold);

        // Quarantine: waiting pairs are skipped until a grid change or the
        // manual timeout releases them.
        let (blocked, _state) = self.quarantine.should_block(symbol, Some(current_grid));
        if blocked {
            return;
        }
        if self.dual_limit_backoff.should_skip(symbol) {
            return;
        }

        // Risk gates.
        self.stability
            .record_sample(symbol, spread.price_buy, spread.price_sell);
        if !self.stability.passes(symbol, "open") {
            return;
        }
        let quantity = self.config.order_execution.trade_quantity;
        let legs = [
            LiquidityLeg {
                venue: spread.exchange_buy.clone(),
                symbol: symbol.clone(),
                quantity,
                is_buy: true,
                min_required: None,
                desc: "buy leg",
            },
            LiquidityLeg {
                venue: spread.exchange_sell.clone(),
                symbol: symbol.clone(),
                quantity,
                is_buy: false,
                min_required: None,
                desc: "sell leg",
            },
        ];
        if self.liquidity.verify(symbol, "open", &legs).is_some() {
            return;
        }

        let request = ExecutionRequest {
            symbol: symbol.clone(),
            exchange_buy: spread.exchange_buy.clone(),
            exchange_sell: spread.exchange_sell.clone(),
            quantity,
            is_open: true,
            grid_level: Some(current_grid),
        };
        info!(
            symbol = %symbol,
            buy = %request.exchange_buy,
            sell = %request.exchange_sell,
            spread_pct = format!("{:.4}", spread.spread_pct),
            score = format!("{:.4}", opportunity.score),
            grid = current_grid,
            "executing opportunity"
        );

        match self.executor.execute(&request).await {
            ExecutionOutcome::Success {
                filled_quantity, ..
            } => {
                self.dual_limit_backoff.clear(symbol);
                info!(symbol = %symbol, filled_quantity, "execution succeeded");
            }
            ExecutionOutcome::Failure {
                reason,
                dual_limit_unfilled,
            } => {
                if dual_limit_unfilled {
                    self.dual_limit_backoff.schedule(symbol);
                }
                warn!(symbol = %symbol, reason = %reason, "execution failed");
            }
            ExecutionOutcome::ManualIntervention { symbol, reason } => {
                error!(symbol = %symbol, reason = %reason, "execution escalated to manual intervention");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Statistics surface
    // -------------------------------------------------------------------------

    pub fn statistics(&self) -> EngineStatistics {
        EngineStatistics {
            running: self.running.load(Ordering::Relaxed),
            monitored_symbols: self.config.symbols.len(),
            venues: self.health.statistics(),
            quarantined: self.quarantine.list_states(),
            pending_orders: self.tracker.pending_count(),
            aggregator: self.aggregator.metrics(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrage::models::{OpportunityKind, PriceSpread};
    use chrono::Utc;

    fn orchestrator() -> Arc<UnifiedOrchestrator> {
        let mut config = RuntimeConfig::default();
        config.symbols = vec!["BTC-USDC-PERP".to_string()];
        // No venue credentials: adapters map stays empty, which is fine for
        // the pure decision-path tests below.
        UnifiedOrchestrator::new(config)
    }

    fn opportunity(score: f64) -> ArbitrageOpportunity {
        ArbitrageOpportunity {
            symbol: "BTC-USDC-PERP".into(),
            kind: OpportunityKind::PriceSpread,
            price_spread: Some(PriceSpread {
                symbol: "BTC-USDC-PERP".into(),
                exchange_buy: "backpack".into(),
                exchange_sell: "grvt".into(),
                price_buy: 100.0,
                price_sell: 100.0 + score,
                size_buy: Some(10.0),
                size_sell: Some(10.0),
                spread_abs: score,
                spread_pct: score,
                timestamp: Utc::now(),
            }),
            funding_spread: None,
            score,
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn candidate_selection_respects_min_score() {
        let orc = orchestrator();
        assert!(orc.pick_candidate(&[opportunity(0.0001)]).is_none());
        assert!(orc.pick_candidate(&[opportunity(0.5)]).is_some());
        assert!(orc.pick_candidate(&[]).is_none());
    }

    #[test]
    fn candidate_selection_skips_funding_only_entries() {
        let orc = orchestrator();
        let mut funding_only = opportunity(0.5);
        funding_only.price_spread = None;
        funding_only.kind = OpportunityKind::FundingRate;
        assert!(orc.pick_candidate(&[funding_only]).is_none());
    }

    #[tokio::test]
    async fn statistics_reflect_initial_state() {
        let orc = orchestrator();
        let stats = orc.statistics();
        assert!(!stats.running);
        assert_eq!(stats.monitored_symbols, 1);
        assert!(stats.quarantined.is_empty());
        assert_eq!(stats.pending_orders, 0);
    }

    #[tokio::test]
    async fn quarantined_symbol_is_skipped_by_the_scan_path() {
        let orc = orchestrator();
        orc.quarantine.defer(
            "BTC-USDC-PERP",
            "manual intervention required",
            Some(1),
            None,
            None,
        );
        // handle_opportunity returns before reaching the executor (which
        // would fail loudly on the empty adapter map).
        orc.handle_opportunity(&opportunity(0.5)).await;
        assert!(orc.quarantine.is_waiting("BTC-USDC-PERP"));
    }
}
