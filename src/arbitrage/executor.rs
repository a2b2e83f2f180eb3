// =============================================================================
// Two-Legged Executor — submit, monitor, repair
// =============================================================================
//
// Submission paths:
//   - batched market on the batch-capable venue (both legs, atomic enqueue)
//   - dual-limit at top-of-book (maker attempt, falls back on timeout)
//   - market-market via REST (repair path and generic fallback)
//
// The single-leg protocol is the core risk control: when exactly one leg
// fills, the filled leg is NEVER unwound. The unfilled side is resubmitted
// as a market order at 50x the normal slippage (twice), then as an
// aggressive IOC limit at the 50x protective price; if all three attempts
// fail the pair is deferred for manual intervention. A repair success still
// counts as success for the caller, but three consecutive single-leg events
// on a symbol defer it anyway.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::adapters::{BatchMarketOrder, ExchangeAdapter, OrderCallback, OrderRequest};
use crate::arbitrage::quarantine::{QuarantineManager, ReduceOnlyGuard};
use crate::config::OrderExecutionConfig;
use crate::error::{ExchangeError, ExchangeResult};
use crate::market_data::MarketDataAggregator;
use crate::symbol::is_perp;
use crate::types::{OrderSide, OrderState, OrderType, QTY_EPSILON};

/// Slippage multiplier applied to every repair attempt.
const REPAIR_SLIPPAGE_MULTIPLIER: f64 = 50.0;
/// Repair attempts before escalating to manual intervention.
const MAX_REPAIR_ATTEMPTS: u32 = 3;
/// Consecutive single-leg events on one symbol before the pair is deferred.
const SINGLE_LEG_DEFER_THRESHOLD: u32 = 3;
/// REST polling cadence for venues without an order push stream.
const FILL_POLL_INTERVAL: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Requests & outcomes
// ---------------------------------------------------------------------------

/// One qualified two-legged trade handed over by the orchestrator.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub symbol: String,
    pub exchange_buy: String,
    pub exchange_sell: String,
    pub quantity: f64,
    /// Opening a new pair position vs closing an existing one. Closing
    /// legs on perp markets carry reduce_only.
    pub is_open: bool,
    pub grid_level: Option<u32>,
}

impl ExecutionRequest {
    fn action(&self) -> &'static str {
        if self.is_open {
            "open"
        } else {
            "close"
        }
    }
}

/// Tagged outcome of one execution attempt.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Success {
        order_buy: Option<OrderState>,
        order_sell: Option<OrderState>,
        filled_quantity: f64,
    },
    Failure {
        reason: String,
        /// Set when both dual-limit legs expired unfilled; the caller
        /// schedules the dual-limit backoff from this.
        dual_limit_unfilled: bool,
    },
    ManualIntervention {
        symbol: String,
        reason: String,
    },
}

impl ExecutionOutcome {
    fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
            dual_limit_unfilled: false,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

// ---------------------------------------------------------------------------
// Order tracker — per-order fill futures fed by push streams
// ---------------------------------------------------------------------------

/// Routes order pushes to per-order channels. The executor registers every
/// pending order; pushes arriving for unknown orders are dropped (they
/// belong to past attempts or other processes).
pub struct OrderTracker {
    channels: Mutex<HashMap<String, mpsc::UnboundedSender<OrderState>>>,
    /// client_id -> order_id alias, for venues that ack by client id first.
    aliases: Mutex<HashMap<String, String>>,
}

impl OrderTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            aliases: Mutex::new(HashMap::new()),
        })
    }

    /// The callback to hand to `subscribe_user_data` on every venue.
    pub fn order_callback(self: &Arc<Self>) -> OrderCallback {
        let tracker = self.clone();
        Arc::new(move |order: OrderState| {
            tracker.on_push(order);
        })
    }

    fn on_push(&self, order: OrderState) {
        let channels = self.channels.lock();
        let sender = channels.get(&order.order_id).or_else(|| {
            order
                .client_id
                .as_ref()
                .and_then(|cid| self.aliases.lock().get(cid).cloned())
                .and_then(|oid| channels.get(&oid))
        });
        if let Some(tx) = sender {
            let _ = tx.send(order);
        }
    }

    fn register(&self, order: &OrderState) -> mpsc::UnboundedReceiver<OrderState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.lock().insert(order.order_id.clone(), tx);
        if let Some(cid) = &order.client_id {
            self.aliases
                .lock()
                .insert(cid.clone(), order.order_id.clone());
        }
        rx
    }

    fn deregister(&self, order: &OrderState) {
        self.channels.lock().remove(&order.order_id);
        if let Some(cid) = &order.client_id {
            self.aliases.lock().remove(cid);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.channels.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct TwoLegExecutor {
    adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
    aggregator: Arc<MarketDataAggregator>,
    tracker: Arc<OrderTracker>,
    quarantine: Arc<QuarantineManager>,
    reduce_only_guard: Arc<ReduceOnlyGuard>,
    config: OrderExecutionConfig,
    data_freshness: Duration,
    /// Consecutive single-leg events per symbol; cleared by a clean
    /// two-leg fill.
    single_leg_counters: Mutex<HashMap<String, u32>>,
}

impl TwoLegExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
        aggregator: Arc<MarketDataAggregator>,
        tracker: Arc<OrderTracker>,
        quarantine: Arc<QuarantineManager>,
        reduce_only_guard: Arc<ReduceOnlyGuard>,
        config: OrderExecutionConfig,
        data_freshness_seconds: f64,
    ) -> Self {
        Self {
            adapters,
            aggregator,
            tracker,
            quarantine,
            reduce_only_guard,
            config,
            data_freshness: Duration::from_secs_f64(data_freshness_seconds),
            single_leg_counters: Mutex::new(HashMap::new()),
        }
    }

    fn adapter(&self, venue: &str) -> ExchangeResult<Arc<dyn ExchangeAdapter>> {
        self.adapters
            .get(venue)
            .cloned()
            .ok_or_else(|| ExchangeError::Consistency(format!("no adapter for venue {venue}")))
    }

    fn slippage_for(&self, request: &ExecutionRequest) -> f64 {
        if request.is_open {
            self.config.slippage_percent_open
        } else {
            self.config.slippage_percent_close
        }
    }

    fn market_timeout(&self, adapter: &Arc<dyn ExchangeAdapter>) -> Duration {
        adapter
            .market_order_timeout_override()
            .unwrap_or(Duration::from_secs(self.config.lighter_market_order_timeout))
    }

    // -------------------------------------------------------------------------
    // Entry point
    // -------------------------------------------------------------------------

    /// Execute one two-legged trade. Uses the batched path when both legs
    /// live on the same batch-capable venue, market-market via REST
    /// otherwise.
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        let buy_adapter = match self.adapter(&request.exchange_buy) {
            Ok(a) => a,
            Err(e) => return ExecutionOutcome::failure(e.to_string()),
        };
        let sell_adapter = match self.adapter(&request.exchange_sell) {
            Ok(a) => a,
            Err(e) => return ExecutionOutcome::failure(e.to_string()),
        };

        if request.exchange_buy == request.exchange_sell
            && buy_adapter.supports_batch_market_orders()
        {
            self.execute_batch(request, &buy_adapter).await
        } else {
            self.execute_market_market(request, &buy_adapter, &sell_adapter)
                .await
        }
    }

    // -------------------------------------------------------------------------
    // Batched market path
    // -------------------------------------------------------------------------

    async fn execute_batch(
        &self,
        request: &ExecutionRequest,
        adapter: &Arc<dyn ExchangeAdapter>,
    ) -> ExecutionOutcome {
        let reduce_only = !request.is_open && is_perp(&request.symbol);
        let legs = vec![
            BatchMarketOrder {
                symbol: request.symbol.clone(),
                side: OrderSide::Buy,
                quantity: request.quantity,
                reduce_only,
            },
            BatchMarketOrder {
                symbol: request.symbol.clone(),
                side: OrderSide::Sell,
                quantity: request.quantity,
                reduce_only,
            },
        ];

        let response = match adapter
            .place_market_orders_batch(&legs, self.slippage_for(request))
            .await
        {
            Ok(r) => r,
            Err(e) => {
                if e.is_reduce_only() {
                    self.register_reduce_only(request, adapter.id(), &e);
                }
                error!(symbol = %request.symbol, error = %e, "batch submit failed");
                return ExecutionOutcome::failure(e.to_string());
            }
        };

        if response.orders.is_empty() {
            if !response.skipped.is_empty() {
                // Nothing to reduce: the venue skipped every leg. Not a
                // failure; there is simply no position left to close.
                info!(
                    symbol = %request.symbol,
                    skipped = ?response.skipped,
                    "batch skipped, no position to reduce"
                );
                return ExecutionOutcome::Success {
                    order_buy: None,
                    order_sell: None,
                    filled_quantity: 0.0,
                };
            }
            return ExecutionOutcome::failure("batch submit returned no orders");
        }

        let order_buy = response
            .orders
            .iter()
            .find(|o| o.side == OrderSide::Buy)
            .cloned();
        let order_sell = response
            .orders
            .iter()
            .find(|o| o.side == OrderSide::Sell)
            .cloned();
        info!(
            symbol = %request.symbol,
            buy_id = order_buy.as_ref().map(|o| o.order_id.clone()).unwrap_or_else(|| "-".into()),
            sell_id = order_sell.as_ref().map(|o| o.order_id.clone()).unwrap_or_else(|| "-".into()),
            "batch market orders submitted"
        );

        let timeout = self.market_timeout(adapter);
        self.settle_two_legs(request, adapter, adapter, order_buy, order_sell, timeout)
            .await
    }

    // -------------------------------------------------------------------------
    // Market-market via REST
    // -------------------------------------------------------------------------

    async fn execute_market_market(
        &self,
        request: &ExecutionRequest,
        buy_adapter: &Arc<dyn ExchangeAdapter>,
        sell_adapter: &Arc<dyn ExchangeAdapter>,
    ) -> ExecutionOutcome {
        let reduce_only = !request.is_open && is_perp(&request.symbol);

        let mut buy_req = OrderRequest::market(&request.symbol, OrderSide::Buy, request.quantity);
        buy_req.reduce_only = reduce_only;
        let mut sell_req = OrderRequest::market(&request.symbol, OrderSide::Sell, request.quantity);
        sell_req.reduce_only = reduce_only;

        let (buy_result, sell_result) = tokio::join!(
            buy_adapter.create_order(&buy_req),
            sell_adapter.create_order(&sell_req)
        );

        // A reduce-only rejection on either side flags both legs for the
        // probe cycle and fails the attempt.
        for (result, adapter) in [(&buy_result, buy_adapter), (&sell_result, sell_adapter)] {
            if let Err(e) = result {
                if e.is_reduce_only() {
                    self.register_reduce_only(request, adapter.id(), e);
                    return ExecutionOutcome::failure(e.to_string());
                }
            }
        }

        let order_buy = match buy_result {
            Ok(o) => Some(o),
            Err(e) => {
                warn!(symbol = %request.symbol, error = %e, "buy leg submit failed");
                None
            }
        };
        let order_sell = match sell_result {
            Ok(o) => Some(o),
            Err(e) => {
                warn!(symbol = %request.symbol, error = %e, "sell leg submit failed");
                None
            }
        };
        if order_buy.is_none() && order_sell.is_none() {
            return ExecutionOutcome::failure("both market legs failed to submit");
        }

        let timeout = self
            .market_timeout(buy_adapter)
            .max(self.market_timeout(sell_adapter));
        self.settle_two_legs(
            request,
            buy_adapter,
            sell_adapter,
            order_buy,
            order_sell,
            timeout,
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Dual-limit path
    // -------------------------------------------------------------------------

    /// Submit both legs as limit orders at current top-of-book. Both
    /// unfilled at timeout: cancel and report (the caller schedules the
    /// backoff). One filled: the single-leg protocol takes over.
    pub async fn execute_dual_limit(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        let buy_adapter = match self.adapter(&request.exchange_buy) {
            Ok(a) => a,
            Err(e) => return ExecutionOutcome::failure(e.to_string()),
        };
        let sell_adapter = match self.adapter(&request.exchange_sell) {
            Ok(a) => a,
            Err(e) => return ExecutionOutcome::failure(e.to_string()),
        };

        let Some(buy_book) =
            self.aggregator
                .get_book(&request.exchange_buy, &request.symbol, self.data_freshness)
        else {
            return ExecutionOutcome::failure("no fresh book for buy venue");
        };
        let Some(sell_book) =
            self.aggregator
                .get_book(&request.exchange_sell, &request.symbol, self.data_freshness)
        else {
            return ExecutionOutcome::failure("no fresh book for sell venue");
        };
        let (Some(buy_bid), Some(sell_ask)) = (buy_book.best_bid, sell_book.best_ask) else {
            return ExecutionOutcome::failure("books missing a side");
        };

        let reduce_only = !request.is_open && is_perp(&request.symbol);
        let mut buy_req = OrderRequest::limit(
            &request.symbol,
            OrderSide::Buy,
            request.quantity,
            buy_bid.price,
        );
        buy_req.reduce_only = reduce_only;
        let mut sell_req = OrderRequest::limit(
            &request.symbol,
            OrderSide::Sell,
            request.quantity,
            sell_ask.price,
        );
        sell_req.reduce_only = reduce_only;

        let (buy_result, sell_result) = tokio::join!(
            buy_adapter.create_order(&buy_req),
            sell_adapter.create_order(&sell_req)
        );
        let order_buy = buy_result.ok();
        let order_sell = sell_result.ok();
        if order_buy.is_none() && order_sell.is_none() {
            return ExecutionOutcome::failure("both limit legs failed to submit");
        }

        let timeout = Duration::from_secs(self.config.limit_order_timeout);
        let (buy_filled, sell_filled) = self
            .await_both_fills(&buy_adapter, &sell_adapter, &order_buy, &order_sell, timeout)
            .await;

        if buy_filled <= QTY_EPSILON && sell_filled <= QTY_EPSILON {
            // Neither leg traded: cancel both and back off.
            for (adapter, order) in [(&buy_adapter, &order_buy), (&sell_adapter, &order_sell)] {
                if let Some(o) = order {
                    if let Err(e) = adapter.cancel_order(&o.order_id, &o.symbol).await {
                        warn!(order_id = %o.order_id, error = %e, "dual-limit cancel failed");
                    }
                }
            }
            warn!(symbol = %request.symbol, "dual-limit legs both unfilled");
            return ExecutionOutcome::Failure {
                reason: "dual-limit legs both unfilled".into(),
                dual_limit_unfilled: true,
            };
        }

        self.resolve_leg_fills(
            request,
            &buy_adapter,
            &sell_adapter,
            order_buy,
            order_sell,
            buy_filled,
            sell_filled,
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Fill settlement & the single-leg protocol
    // -------------------------------------------------------------------------

    async fn settle_two_legs(
        &self,
        request: &ExecutionRequest,
        buy_adapter: &Arc<dyn ExchangeAdapter>,
        sell_adapter: &Arc<dyn ExchangeAdapter>,
        order_buy: Option<OrderState>,
        order_sell: Option<OrderState>,
        timeout: Duration,
    ) -> ExecutionOutcome {
        let (buy_filled, sell_filled) = self
            .await_both_fills(buy_adapter, sell_adapter, &order_buy, &order_sell, timeout)
            .await;

        if buy_filled <= QTY_EPSILON && sell_filled <= QTY_EPSILON {
            error!(
                symbol = %request.symbol,
                "both legs unfilled within timeout, rescanning"
            );
            return ExecutionOutcome::failure("both legs unfilled within timeout");
        }

        self.resolve_leg_fills(
            request,
            buy_adapter,
            sell_adapter,
            order_buy,
            order_sell,
            buy_filled,
            sell_filled,
        )
        .await
    }

    /// Wait both legs' fill futures concurrently.
    async fn await_both_fills(
        &self,
        buy_adapter: &Arc<dyn ExchangeAdapter>,
        sell_adapter: &Arc<dyn ExchangeAdapter>,
        order_buy: &Option<OrderState>,
        order_sell: &Option<OrderState>,
        timeout: Duration,
    ) -> (f64, f64) {
        let buy_wait = async {
            match order_buy {
                Some(o) => self.wait_for_fill(buy_adapter, o, timeout).await,
                None => 0.0,
            }
        };
        let sell_wait = async {
            match order_sell {
                Some(o) => self.wait_for_fill(sell_adapter, o, timeout).await,
                None => 0.0,
            }
        };
        tokio::join!(buy_wait, sell_wait)
    }

    /// Resolve the post-wait fill table: both filled is success, exactly
    /// one filled enters the repair flow.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_leg_fills(
        &self,
        request: &ExecutionRequest,
        buy_adapter: &Arc<dyn ExchangeAdapter>,
        sell_adapter: &Arc<dyn ExchangeAdapter>,
        order_buy: Option<OrderState>,
        order_sell: Option<OrderState>,
        buy_filled: f64,
        sell_filled: f64,
    ) -> ExecutionOutcome {
        if buy_filled > QTY_EPSILON && sell_filled > QTY_EPSILON {
            self.reset_single_leg_counter(&request.symbol);
            let filled = buy_filled.min(sell_filled);
            self.log_execution_summary(request, &order_buy, &order_sell);
            return ExecutionOutcome::Success {
                order_buy,
                order_sell,
                filled_quantity: filled,
            };
        }

        // Exactly one leg filled.
        let buy_unfilled = buy_filled <= QTY_EPSILON;
        let filled_quantity = if buy_unfilled { sell_filled } else { buy_filled };
        let count = self.bump_single_leg_counter(&request.symbol);
        let (repair_adapter, repair_is_buy) = if buy_unfilled {
            (buy_adapter, true)
        } else {
            (sell_adapter, false)
        };

        error!(
            symbol = %request.symbol,
            single_leg_count = count,
            filled_side = if buy_unfilled { "sell" } else { "buy" },
            filled_quantity,
            "single-leg fill, repairing the unfilled side"
        );

        let repair_order = self
            .repair_leg(request, repair_adapter, repair_is_buy, filled_quantity)
            .await;

        let Some(repair_order) = repair_order else {
            // All repair attempts failed: directional exposure remains.
            let reason = "manual intervention required: single-leg repair failed".to_string();
            self.quarantine.defer(
                &request.symbol,
                &reason,
                request.grid_level,
                Some(&request.exchange_buy),
                Some(&request.exchange_sell),
            );
            return ExecutionOutcome::ManualIntervention {
                symbol: request.symbol.clone(),
                reason,
            };
        };

        // Repair success: splice the repair order in for the failed leg and
        // report success. The streak counter still applies.
        let (order_buy, order_sell) = if buy_unfilled {
            (Some(repair_order), order_sell)
        } else {
            (order_buy, Some(repair_order))
        };
        self.log_execution_summary(request, &order_buy, &order_sell);

        if count >= SINGLE_LEG_DEFER_THRESHOLD {
            warn!(
                symbol = %request.symbol,
                count,
                "consecutive single-leg limit reached, deferring pair (this attempt still succeeded)"
            );
            self.quarantine.defer(
                &request.symbol,
                &format!("{count} consecutive single-leg fills"),
                request.grid_level,
                Some(&request.exchange_buy),
                Some(&request.exchange_sell),
            );
        }

        ExecutionOutcome::Success {
            order_buy,
            order_sell,
            filled_quantity,
        }
    }

    /// The three-attempt repair ladder for an unfilled leg. Returns the
    /// filled repair order, or `None` when all attempts failed.
    async fn repair_leg(
        &self,
        request: &ExecutionRequest,
        adapter: &Arc<dyn ExchangeAdapter>,
        is_buy: bool,
        quantity: f64,
    ) -> Option<OrderState> {
        let side = if is_buy { OrderSide::Buy } else { OrderSide::Sell };
        let reduce_only = !request.is_open && is_perp(&request.symbol);
        let emergency_slippage = {
            let normal = self.slippage_for(request);
            if normal > 0.0 {
                normal * REPAIR_SLIPPAGE_MULTIPLIER
            } else {
                0.5
            }
        };
        let timeout = self.market_timeout(adapter);

        for attempt in 1..=MAX_REPAIR_ATTEMPTS {
            warn!(
                symbol = %request.symbol,
                attempt,
                side = %side,
                quantity,
                slippage = emergency_slippage,
                "repair attempt"
            );

            let submitted = if attempt < MAX_REPAIR_ATTEMPTS {
                // Attempts 1-2: plain market order; the venue applies the
                // widened slippage band.
                let mut req = OrderRequest::market(&request.symbol, side, quantity);
                req.reduce_only = reduce_only;
                adapter.create_order(&req).await
            } else {
                // Attempt 3: aggressive IOC limit at the protective price.
                match self
                    .protective_price(adapter, request, side, emergency_slippage)
                    .await
                {
                    Some(price) => {
                        let mut req =
                            OrderRequest::limit(&request.symbol, side, quantity, price);
                        req.order_type = OrderType::Ioc;
                        req.reduce_only = reduce_only;
                        adapter.create_order(&req).await
                    }
                    None => Err(ExchangeError::Consistency(
                        "no reference price for protective limit".into(),
                    )),
                }
            };

            let order = match submitted {
                Ok(o) => o,
                Err(e) => {
                    error!(symbol = %request.symbol, attempt, error = %e, "repair submit failed");
                    continue;
                }
            };

            let filled = self.wait_for_fill(adapter, &order, timeout).await;
            if filled > QTY_EPSILON {
                info!(
                    symbol = %request.symbol,
                    attempt,
                    filled,
                    order_id = %order.order_id,
                    "repair filled"
                );
                return Some(order);
            }

            error!(
                symbol = %request.symbol,
                attempt,
                order_id = %order.order_id,
                "repair attempt expired unfilled"
            );
            if attempt == MAX_REPAIR_ATTEMPTS {
                // The IOC may be resting if the venue treated it as GTC;
                // cancel so nothing lingers behind the escalation.
                if let Err(e) = adapter.cancel_order(&order.order_id, &order.symbol).await {
                    warn!(order_id = %order.order_id, error = %e, "repair IOC cancel failed");
                }
            }
        }
        None
    }

    /// Protective limit price for the aggressive IOC: top-of-book shifted
    /// by the emergency slippage in the taker direction.
    async fn protective_price(
        &self,
        adapter: &Arc<dyn ExchangeAdapter>,
        request: &ExecutionRequest,
        side: OrderSide,
        slippage: f64,
    ) -> Option<f64> {
        let book = match self
            .aggregator
            .get_book(adapter.id(), &request.symbol, self.data_freshness)
        {
            Some(b) => b,
            None => adapter.get_orderbook(&request.symbol, Some(1)).await.ok()?,
        };
        match side {
            OrderSide::Buy => book.best_ask.map(|l| l.price * (1.0 + slippage)),
            OrderSide::Sell => book.best_bid.map(|l| l.price * (1.0 - slippage)),
        }
    }

    // -------------------------------------------------------------------------
    // Fill waiting
    // -------------------------------------------------------------------------

    /// Wait for a terminal push on `order`, up to `timeout`. Venues without
    /// a user stream are REST-polled at a slow cadence inside the same
    /// wait. Returns the filled quantity observed (0 on a silent timeout).
    pub async fn wait_for_fill(
        &self,
        adapter: &Arc<dyn ExchangeAdapter>,
        order: &OrderState,
        timeout: Duration,
    ) -> f64 {
        let mut tracked = order.clone();
        if tracked.status.is_terminal() {
            return tracked.filled;
        }

        let mut rx = self.tracker.register(&tracked);
        let mut poll = tokio::time::interval(FILL_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        poll.tick().await; // first tick is immediate; skip it

        let deadline = tokio::time::Instant::now() + timeout;
        let filled = loop {
            tokio::select! {
                update = rx.recv() => {
                    match update {
                        Some(push) => {
                            tracked.merge_update(&push);
                            if tracked.status.is_terminal() {
                                break tracked.filled;
                            }
                        }
                        None => break tracked.filled,
                    }
                }
                _ = poll.tick() => {
                    // REST fallback keeps venues without push streams
                    // honest; terminal orders may have left the live set,
                    // so the lookup falls through to order history.
                    if let Ok(fresh) = crate::adapters::get_order_with_history_fallback(
                        adapter.as_ref(),
                        &tracked.order_id,
                        &tracked.symbol,
                    )
                    .await
                    {
                        tracked.merge_update(&fresh);
                        if tracked.status.is_terminal() {
                            break tracked.filled;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    break tracked.filled;
                }
            }
        };
        self.tracker.deregister(&tracked);
        filled
    }

    // -------------------------------------------------------------------------
    // Reduce-only handling & probes
    // -------------------------------------------------------------------------

    fn register_reduce_only(
        &self,
        request: &ExecutionRequest,
        venue: &str,
        error: &ExchangeError,
    ) {
        warn!(
            symbol = %request.symbol,
            venue,
            error = %error,
            "reduce-only rejection, flagging both legs for probing"
        );
        for leg_venue in [&request.exchange_buy, &request.exchange_sell] {
            self.reduce_only_guard.register_event(
                &request.symbol,
                leg_venue,
                &request.symbol,
                &error.to_string(),
            );
        }
        self.quarantine.defer(
            &request.symbol,
            "reduce-only restriction, probe pending",
            request.grid_level,
            Some(&request.exchange_buy),
            Some(&request.exchange_sell),
        );
    }

    /// Submit one minimum-quantity, far-from-market probe order on a
    /// flagged leg. Acceptance (followed by an immediate cancel) means the
    /// restriction lifted; the reduce-only code means it has not.
    pub async fn probe_reduce_only_leg(
        &self,
        venue: &str,
        symbol: &str,
        quantity: f64,
        price: f64,
    ) -> bool {
        let Ok(adapter) = self.adapter(venue) else {
            return false;
        };
        let mut req = OrderRequest::limit(symbol, OrderSide::Buy, quantity, price);
        req.reduce_only = true;
        match adapter.create_order(&req).await {
            Ok(order) => {
                // Accepted: restriction cleared. Remove the probe order so
                // nothing rests out-of-market.
                if let Err(e) = adapter.cancel_order(&order.order_id, symbol).await {
                    warn!(venue, symbol, error = %e, "probe order cancel failed");
                }
                true
            }
            Err(e) if e.is_reduce_only() => false,
            Err(e) => {
                warn!(venue, symbol, error = %e, "probe submit failed");
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Counters & summaries
    // -------------------------------------------------------------------------

    fn bump_single_leg_counter(&self, symbol: &str) -> u32 {
        let mut counters = self.single_leg_counters.lock();
        let count = counters.entry(symbol.to_uppercase()).or_insert(0);
        *count += 1;
        *count
    }

    fn reset_single_leg_counter(&self, symbol: &str) {
        let mut counters = self.single_leg_counters.lock();
        if let Some(count) = counters.get_mut(&symbol.to_uppercase()) {
            if *count > 0 {
                info!(symbol, previous = *count, "single-leg counter cleared");
            }
            *count = 0;
        }
    }

    #[cfg(test)]
    fn single_leg_count(&self, symbol: &str) -> u32 {
        *self
            .single_leg_counters
            .lock()
            .get(&symbol.to_uppercase())
            .unwrap_or(&0)
    }

    fn log_execution_summary(
        &self,
        request: &ExecutionRequest,
        order_buy: &Option<OrderState>,
        order_sell: &Option<OrderState>,
    ) {
        let leg = |o: &Option<OrderState>| match o {
            Some(o) => format!(
                "{}@{}",
                o.filled,
                o.average.or(o.price).unwrap_or(0.0)
            ),
            None => "-".into(),
        };
        info!(
            symbol = %request.symbol,
            action = request.action(),
            buy_venue = %request.exchange_buy,
            sell_venue = %request.exchange_sell,
            buy = leg(order_buy),
            sell = leg(order_sell),
            "two-leg execution complete"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderStatus;
    use chrono::Utc;

    fn order(id: &str, side: OrderSide, status: OrderStatus, filled: f64) -> OrderState {
        OrderState {
            order_id: id.into(),
            client_id: Some(format!("c-{id}")),
            symbol: "BTC-USDC-PERP".into(),
            side,
            order_type: OrderType::Market,
            amount: 1.0,
            price: None,
            filled,
            remaining: 1.0 - filled,
            average: None,
            status,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn tracker_routes_pushes_by_order_id() {
        let tracker = OrderTracker::new();
        let pending = order("42", OrderSide::Buy, OrderStatus::Open, 0.0);
        let mut rx = tracker.register(&pending);

        let cb = tracker.order_callback();
        cb(order("42", OrderSide::Buy, OrderStatus::Filled, 1.0));

        let push = rx.recv().await.unwrap();
        assert_eq!(push.status, OrderStatus::Filled);
        tracker.deregister(&pending);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn tracker_resolves_client_id_aliases() {
        let tracker = OrderTracker::new();
        let pending = order("42", OrderSide::Buy, OrderStatus::Open, 0.0);
        let mut rx = tracker.register(&pending);

        // Push arrives keyed by a different venue id but the same client id.
        let mut push = order("venue-77", OrderSide::Buy, OrderStatus::Filled, 1.0);
        push.client_id = Some("c-42".into());
        tracker.on_push(push);

        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn tracker_drops_unknown_orders() {
        let tracker = OrderTracker::new();
        // No registration: push is silently dropped.
        tracker.on_push(order("99", OrderSide::Sell, OrderStatus::Filled, 1.0));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn outcome_helpers() {
        assert!(!ExecutionOutcome::failure("x").is_success());
        assert!(ExecutionOutcome::Success {
            order_buy: None,
            order_sell: None,
            filled_quantity: 0.0
        }
        .is_success());
    }

    #[test]
    fn execution_request_action_labels() {
        let mut request = ExecutionRequest {
            symbol: "BTC-USDC-PERP".into(),
            exchange_buy: "lighter".into(),
            exchange_sell: "lighter".into(),
            quantity: 1.0,
            is_open: true,
            grid_level: Some(1),
        };
        assert_eq!(request.action(), "open");
        request.is_open = false;
        assert_eq!(request.action(), "close");
    }

    // -------------------------------------------------------------------------
    // Mock venue for the single-leg protocol
    // -------------------------------------------------------------------------

    use crate::adapters::{
        BatchSubmitResponse, BookCallback, ExchangeAdapter, ExchangeInfo, HealthStatus,
        TickerCallback, TradeCallback,
    };
    use crate::arbitrage::detector::DetectorConfig;
    use crate::error::ExchangeResult;
    use crate::types::{Balance, Candle, OrderBookTop, Position, TickerSnapshot, TradePrint};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Batch-capable venue whose leg fills are scripted: the batch legs
    /// fill (or not) per flag, and each subsequent create_order (the repair
    /// ladder) pops one scripted outcome.
    struct MockVenue {
        fill_buy: bool,
        fill_sell: bool,
        repair_outcomes: Mutex<VecDeque<bool>>,
        created: Mutex<Vec<OrderRequest>>,
        next_id: AtomicU64,
    }

    impl MockVenue {
        fn new(fill_buy: bool, fill_sell: bool, repairs: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                fill_buy,
                fill_sell,
                repair_outcomes: Mutex::new(repairs.iter().copied().collect()),
                created: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            })
        }

        fn make_order(&self, symbol: &str, side: OrderSide, amount: f64, filled: bool) -> OrderState {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            OrderState {
                order_id: format!("m{id}"),
                client_id: None,
                symbol: symbol.into(),
                side,
                order_type: OrderType::Market,
                amount,
                price: None,
                filled: if filled { amount } else { 0.0 },
                remaining: if filled { 0.0 } else { amount },
                average: filled.then_some(100.0),
                status: if filled {
                    OrderStatus::Filled
                } else {
                    OrderStatus::Open
                },
                created_at: Utc::now(),
                updated_at: None,
            }
        }
    }

    #[async_trait]
    impl ExchangeAdapter for MockVenue {
        fn id(&self) -> &str {
            "lighter"
        }
        async fn connect(&self) -> ExchangeResult<()> {
            Ok(())
        }
        async fn disconnect(&self) -> ExchangeResult<()> {
            Ok(())
        }
        async fn authenticate(&self) -> ExchangeResult<()> {
            Ok(())
        }
        async fn health_check(&self) -> ExchangeResult<HealthStatus> {
            Ok(HealthStatus {
                api_accessible: true,
                latency_ms: 1,
                message: None,
            })
        }
        async fn get_exchange_info(&self) -> ExchangeResult<ExchangeInfo> {
            Err(ExchangeError::Unsupported("mock".into()))
        }
        async fn get_supported_symbols(&self) -> ExchangeResult<Vec<String>> {
            Ok(vec![])
        }
        async fn get_ticker(&self, _: &str) -> ExchangeResult<TickerSnapshot> {
            Err(ExchangeError::Unsupported("mock".into()))
        }
        async fn get_tickers(&self, _: &[String]) -> ExchangeResult<Vec<TickerSnapshot>> {
            Ok(vec![])
        }
        async fn get_orderbook(&self, symbol: &str, _: Option<u32>) -> ExchangeResult<OrderBookTop> {
            Ok(OrderBookTop {
                symbol: symbol.into(),
                best_bid: Some(crate::types::BookLevel {
                    price: 99.9,
                    size: Some(10.0),
                }),
                best_ask: Some(crate::types::BookLevel {
                    price: 100.0,
                    size: Some(10.0),
                }),
                event_time: None,
            })
        }
        async fn get_ohlcv(
            &self,
            _: &str,
            _: &str,
            _: Option<i64>,
            _: Option<u32>,
        ) -> ExchangeResult<Vec<Candle>> {
            Ok(vec![])
        }
        async fn get_trades(
            &self,
            _: &str,
            _: Option<i64>,
            _: Option<u32>,
        ) -> ExchangeResult<Vec<TradePrint>> {
            Ok(vec![])
        }
        async fn get_balances(&self, _: bool) -> ExchangeResult<Vec<Balance>> {
            Ok(vec![])
        }
        async fn get_positions(&self, _: Option<&[String]>) -> ExchangeResult<Vec<Position>> {
            Ok(vec![])
        }
        async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderState> {
            self.created.lock().push(request.clone());
            let fills = self.repair_outcomes.lock().pop_front().unwrap_or(false);
            Ok(self.make_order(&request.symbol, request.side, request.amount, fills))
        }
        async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderState> {
            let mut order = self.make_order(symbol, OrderSide::Buy, 0.0, false);
            order.order_id = order_id.into();
            order.status = OrderStatus::Canceled;
            Ok(order)
        }
        async fn cancel_all_orders(&self, _: Option<&str>) -> ExchangeResult<Vec<OrderState>> {
            Ok(vec![])
        }
        async fn get_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderState> {
            let mut order = self.make_order(symbol, OrderSide::Buy, 1.0, false);
            order.order_id = order_id.into();
            Ok(order)
        }
        async fn get_open_orders(&self, _: Option<&str>) -> ExchangeResult<Vec<OrderState>> {
            Ok(vec![])
        }
        async fn get_order_history(
            &self,
            _: Option<&str>,
            _: Option<i64>,
            _: Option<u32>,
        ) -> ExchangeResult<Vec<OrderState>> {
            Ok(vec![])
        }
        async fn subscribe_ticker(&self, _: &str, _: Option<TickerCallback>) -> ExchangeResult<()> {
            Ok(())
        }
        async fn subscribe_orderbook(&self, _: &str, _: Option<BookCallback>) -> ExchangeResult<()> {
            Ok(())
        }
        async fn subscribe_trades(&self, _: &str, _: Option<TradeCallback>) -> ExchangeResult<()> {
            Ok(())
        }
        async fn subscribe_user_data(&self, _: OrderCallback) -> ExchangeResult<()> {
            Ok(())
        }
        async fn unsubscribe(&self, _: Option<&str>) -> ExchangeResult<()> {
            Ok(())
        }
        fn supports_batch_market_orders(&self) -> bool {
            true
        }
        async fn place_market_orders_batch(
            &self,
            orders: &[BatchMarketOrder],
            _: f64,
        ) -> ExchangeResult<BatchSubmitResponse> {
            let orders = orders
                .iter()
                .map(|o| {
                    let fills = match o.side {
                        OrderSide::Buy => self.fill_buy,
                        OrderSide::Sell => self.fill_sell,
                    };
                    self.make_order(&o.symbol, o.side, o.quantity, fills)
                })
                .collect();
            Ok(BatchSubmitResponse {
                orders,
                skipped: vec![],
            })
        }
        fn market_order_timeout_override(&self) -> Option<Duration> {
            // Keep the tests fast: unfilled legs time out in 50 ms.
            Some(Duration::from_millis(50))
        }
    }

    fn executor_with(venue: Arc<MockVenue>) -> (TwoLegExecutor, Arc<QuarantineManager>) {
        let aggregator = MarketDataAggregator::new(
            vec!["BTC-USDC-PERP".to_string()],
            DetectorConfig {
                price_spread_threshold: 0.1,
                funding_rate_threshold: 0.0001,
            },
        );
        let quarantine = Arc::new(QuarantineManager::new());
        let mut adapters: HashMap<String, Arc<dyn ExchangeAdapter>> = HashMap::new();
        adapters.insert("lighter".to_string(), venue);
        let executor = TwoLegExecutor::new(
            adapters,
            aggregator,
            OrderTracker::new(),
            quarantine.clone(),
            Arc::new(ReduceOnlyGuard::new()),
            OrderExecutionConfig::default(),
            5.0,
        );
        (executor, quarantine)
    }

    fn batch_request() -> ExecutionRequest {
        ExecutionRequest {
            symbol: "BTC-USDC-PERP".into(),
            exchange_buy: "lighter".into(),
            exchange_sell: "lighter".into(),
            quantity: 1.0,
            is_open: true,
            grid_level: Some(1),
        }
    }

    #[tokio::test]
    async fn both_legs_filled_is_clean_success() {
        let venue = MockVenue::new(true, true, &[]);
        let (executor, quarantine) = executor_with(venue);
        let outcome = executor.execute(&batch_request()).await;
        assert!(outcome.is_success());
        assert_eq!(executor.single_leg_count("BTC-USDC-PERP"), 0);
        assert!(!quarantine.is_waiting("BTC-USDC-PERP"));
    }

    #[tokio::test]
    async fn both_legs_unfilled_is_plain_failure() {
        let venue = MockVenue::new(false, false, &[]);
        let (executor, quarantine) = executor_with(venue);
        let outcome = executor.execute(&batch_request()).await;
        assert!(matches!(
            outcome,
            ExecutionOutcome::Failure {
                dual_limit_unfilled: false,
                ..
            }
        ));
        // No single-leg event, no quarantine: the orchestrator just rescans.
        assert_eq!(executor.single_leg_count("BTC-USDC-PERP"), 0);
        assert!(!quarantine.is_waiting("BTC-USDC-PERP"));
    }

    #[tokio::test]
    async fn single_leg_repair_success_counts_as_success() {
        // Sell fills, buy does not; first repair market order fills.
        let venue = MockVenue::new(false, true, &[true]);
        let (executor, quarantine) = executor_with(venue.clone());
        let outcome = executor.execute(&batch_request()).await;

        match outcome {
            ExecutionOutcome::Success {
                order_buy,
                order_sell,
                filled_quantity,
            } => {
                assert!(order_buy.is_some(), "repair order replaces the failed leg");
                assert!(order_sell.is_some());
                assert!((filled_quantity - 1.0).abs() < f64::EPSILON);
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(executor.single_leg_count("BTC-USDC-PERP"), 1);
        assert!(!quarantine.is_waiting("BTC-USDC-PERP"));
        // The repair order was a buy for the filled-leg quantity.
        let created = venue.created.lock();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].side, OrderSide::Buy);
        assert!((created[0].amount - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn exhausted_repairs_escalate_to_manual_intervention() {
        // Buy fills, sell does not; all three repair attempts stay unfilled.
        let venue = MockVenue::new(true, false, &[false, false, false]);
        let (executor, quarantine) = executor_with(venue.clone());
        let outcome = executor.execute(&batch_request()).await;

        assert!(matches!(
            outcome,
            ExecutionOutcome::ManualIntervention { .. }
        ));
        assert!(quarantine.is_waiting("BTC-USDC-PERP"));
        let states = quarantine.list_states();
        assert!(states["BTC-USDC-PERP"].reason.starts_with("manual"));
        // Three repair submissions: two markets, then the IOC limit.
        let created = venue.created.lock();
        assert_eq!(created.len(), 3);
        assert_eq!(created[2].order_type, OrderType::Ioc);
        assert!(created[2].price.is_some());
    }

    #[tokio::test]
    async fn third_consecutive_single_leg_defers_but_still_succeeds() {
        let request = batch_request();
        let mut last = None;
        let venue = MockVenue::new(false, true, &[true, true, true]);
        let (executor, quarantine) = executor_with(venue);
        for _ in 0..3 {
            last = Some(executor.execute(&request).await);
        }
        assert!(last.unwrap().is_success(), "the third attempt still succeeds");
        assert_eq!(executor.single_leg_count("BTC-USDC-PERP"), 3);
        assert!(quarantine.is_waiting("BTC-USDC-PERP"));
        let states = quarantine.list_states();
        assert!(states["BTC-USDC-PERP"]
            .reason
            .contains("consecutive single-leg"));
    }
}
