// =============================================================================
// Quarantine — per-pair run/wait state and reduce-only probe bookkeeping
// =============================================================================
//
// A pair enters WAITING when something needs a human or a market change:
// repeated single-leg fills, a failed repair, a reduce-only rejection.
// Resumption paths:
//   - automatic on grid-level change (spread moved to a new band),
//   - automatic 1800 s after a manual-intervention defer,
//   - explicit resume() (probe success, operator action).
//
// State is process-local on purpose: a restart clears all quarantine.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::util::throttle::LogThrottle;

/// A pair deferred with a manual-intervention reason resumes automatically
/// after this long.
pub const MANUAL_INTERVENTION_AUTO_RESUME: Duration = Duration::from_secs(1800);

/// Reasons with this prefix only resume via the timeout, never via a
/// grid-level change.
pub const MANUAL_REASON_PREFIX: &str = "manual";

const DEFER_LOG_THROTTLE: Duration = Duration::from_secs(20);

/// Discretize an observed spread into a grid level (T1, T2, ...): the
/// number of whole band-widths the spread covers, floored at 1.
pub fn grid_level(spread_pct: f64, band_width_pct: f64) -> u32 {
    if band_width_pct <= 0.0 || spread_pct <= 0.0 {
        return 1;
    }
    ((spread_pct / band_width_pct).floor() as u32).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QuarantineStatus {
    Running,
    Waiting,
}

/// One probe attempt against a flagged leg.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeRecord {
    pub venue: String,
    pub symbol: String,
    pub success: bool,
    pub at: DateTime<Utc>,
}

/// WAITING-state record for one pair.
#[derive(Debug, Clone, Serialize)]
pub struct QuarantineState {
    pub status: QuarantineStatus,
    pub reason: String,
    pub grid_level: Option<u32>,
    pub exchange_buy: Option<String>,
    pub exchange_sell: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub probe_history: Vec<ProbeRecord>,
    #[serde(skip)]
    deferred_at: Option<Instant>,
}

impl QuarantineState {
    fn is_manual(&self) -> bool {
        self.reason.starts_with(MANUAL_REASON_PREFIX)
    }
}

/// Per-pair run/wait state. Only WAITING pairs are stored; absence means
/// RUNNING. All public methods acquire the single manager lock.
pub struct QuarantineManager {
    states: Mutex<HashMap<String, QuarantineState>>,
    log_throttle: LogThrottle,
}

impl QuarantineManager {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            log_throttle: LogThrottle::new(),
        }
    }

    /// Mark a pair WAITING. Any component may call this; the newest defer
    /// wins.
    pub fn defer(
        &self,
        symbol: &str,
        reason: &str,
        grid_level: Option<u32>,
        exchange_buy: Option<&str>,
        exchange_sell: Option<&str>,
    ) {
        if symbol.is_empty() {
            return;
        }
        let key = symbol.to_uppercase();
        let state = QuarantineState {
            status: QuarantineStatus::Waiting,
            reason: reason.to_string(),
            grid_level,
            exchange_buy: exchange_buy.map(String::from),
            exchange_sell: exchange_sell.map(String::from),
            updated_at: Utc::now(),
            probe_history: Vec::new(),
            deferred_at: Some(Instant::now()),
        };
        self.states.lock().insert(key.clone(), state);
        if self
            .log_throttle
            .should_log(&format!("defer:{key}"), DEFER_LOG_THROTTLE)
        {
            warn!(
                symbol = %key,
                reason,
                grid_level = grid_level.map(|g| format!("T{g}")).unwrap_or_else(|| "-".into()),
                "pair deferred"
            );
        }
    }

    /// Return a pair to RUNNING. A no-op if it was not waiting.
    pub fn resume(&self, symbol: &str, cause: &str) {
        let key = symbol.to_uppercase();
        let removed = self.states.lock().remove(&key);
        if removed.is_some()
            && self
                .log_throttle
                .should_log(&format!("resume:{key}"), DEFER_LOG_THROTTLE)
        {
            info!(symbol = %key, cause, "pair resumed");
        }
    }

    pub fn is_waiting(&self, symbol: &str) -> bool {
        self.states
            .lock()
            .contains_key(&symbol.to_uppercase())
    }

    /// Decide whether scanning should skip this pair.
    ///
    /// Manual-intervention reasons block until the 1800 s timeout; all
    /// other reasons block until the grid level moves off the recorded one.
    pub fn should_block(
        &self,
        symbol: &str,
        current_grid: Option<u32>,
    ) -> (bool, Option<QuarantineState>) {
        let key = symbol.to_uppercase();
        let state = {
            let guard = self.states.lock();
            match guard.get(&key) {
                Some(s) => s.clone(),
                None => return (false, None),
            }
        };

        if state.is_manual() {
            let elapsed = state
                .deferred_at
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed >= MANUAL_INTERVENTION_AUTO_RESUME {
                self.resume(
                    symbol,
                    "manual-intervention wait elapsed, auto-resuming",
                );
                return (false, None);
            }
            return (true, Some(state));
        }

        if let (Some(current), Some(recorded)) = (current_grid, state.grid_level) {
            if current != recorded {
                self.resume(symbol, "grid level changed, auto-resuming");
                return (false, None);
            }
        }
        (true, Some(state))
    }

    /// Append a probe record to a waiting pair's history.
    pub fn record_probe(&self, symbol: &str, record: ProbeRecord) {
        let key = symbol.to_uppercase();
        if let Some(state) = self.states.lock().get_mut(&key) {
            state.probe_history.push(record);
        }
    }

    /// Snapshot of all waiting pairs (for the UI surface).
    pub fn list_states(&self) -> HashMap<String, QuarantineState> {
        self.states.lock().clone()
    }

    #[cfg(test)]
    fn backdate(&self, symbol: &str, age: Duration) {
        if let Some(state) = self.states.lock().get_mut(&symbol.to_uppercase()) {
            state.deferred_at = state.deferred_at.map(|t| t - age);
        }
    }
}

impl Default for QuarantineManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Reduce-only guard
// ---------------------------------------------------------------------------

/// Legs flagged by a reduce-only rejection, awaiting the hourly probe.
#[derive(Debug, Clone)]
pub struct ReduceOnlyState {
    pub pair_id: String,
    /// `(venue, leg symbol)` pairs still probe-pending.
    pub legs: Vec<(String, String)>,
    pub reason: String,
    pub registered_at: DateTime<Utc>,
}

/// Tracks pairs whose submissions hit the venue's reduce-only rejection.
/// The probe scheduler walks `list_blocked_pairs` at each wall-clock hour.
pub struct ReduceOnlyGuard {
    pairs: Mutex<HashMap<String, ReduceOnlyState>>,
}

impl ReduceOnlyGuard {
    pub fn new() -> Self {
        Self {
            pairs: Mutex::new(HashMap::new()),
        }
    }

    /// Flag one leg of a pair as probe-pending.
    pub fn register_event(&self, pair_id: &str, venue: &str, leg_symbol: &str, reason: &str) {
        let key = pair_id.to_uppercase();
        let mut pairs = self.pairs.lock();
        let state = pairs.entry(key.clone()).or_insert_with(|| ReduceOnlyState {
            pair_id: key.clone(),
            legs: Vec::new(),
            reason: reason.to_string(),
            registered_at: Utc::now(),
        });
        let leg = (venue.to_string(), leg_symbol.to_string());
        if !state.legs.contains(&leg) {
            state.legs.push(leg);
        }
    }

    pub fn list_blocked_pairs(&self) -> Vec<ReduceOnlyState> {
        self.pairs.lock().values().cloned().collect()
    }

    /// Clear a pair after a successful probe.
    pub fn clear(&self, pair_id: &str) {
        self.pairs.lock().remove(&pair_id.to_uppercase());
    }

    pub fn is_blocked(&self, pair_id: &str) -> bool {
        self.pairs.lock().contains_key(&pair_id.to_uppercase())
    }
}

impl Default for ReduceOnlyGuard {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defer_then_block_then_resume() {
        let manager = QuarantineManager::new();
        assert!(!manager.should_block("BTC-USDC-PERP", Some(1)).0);

        manager.defer(
            "btc-usdc-perp",
            "3 consecutive single-leg fills",
            Some(1),
            Some("lighter"),
            Some("backpack"),
        );
        assert!(manager.is_waiting("BTC-USDC-PERP"));
        let (blocked, state) = manager.should_block("BTC-USDC-PERP", Some(1));
        assert!(blocked);
        assert_eq!(state.unwrap().grid_level, Some(1));

        manager.resume("BTC-USDC-PERP", "operator cleared");
        assert!(!manager.is_waiting("BTC-USDC-PERP"));
    }

    #[test]
    fn grid_level_change_auto_resumes() {
        let manager = QuarantineManager::new();
        manager.defer("BTC-USDC-PERP", "single-leg streak", Some(1), None, None);
        assert!(manager.should_block("BTC-USDC-PERP", Some(1)).0);
        // Spread crossed into a new band: unblocked and removed.
        assert!(!manager.should_block("BTC-USDC-PERP", Some(2)).0);
        assert!(!manager.is_waiting("BTC-USDC-PERP"));
    }

    #[test]
    fn manual_reason_ignores_grid_and_times_out() {
        let manager = QuarantineManager::new();
        manager.defer(
            "BTC-USDC-PERP",
            "manual intervention required",
            Some(1),
            None,
            None,
        );
        // Grid change does not release a manual hold.
        assert!(manager.should_block("BTC-USDC-PERP", Some(2)).0);

        manager.backdate("BTC-USDC-PERP", MANUAL_INTERVENTION_AUTO_RESUME);
        assert!(!manager.should_block("BTC-USDC-PERP", Some(2)).0);
        assert!(!manager.is_waiting("BTC-USDC-PERP"));
    }

    #[test]
    fn manual_hold_blocks_before_timeout() {
        let manager = QuarantineManager::new();
        manager.defer("BTC-USDC-PERP", "manual intervention required", None, None, None);
        manager.backdate(
            "BTC-USDC-PERP",
            MANUAL_INTERVENTION_AUTO_RESUME - Duration::from_secs(5),
        );
        assert!(manager.should_block("BTC-USDC-PERP", None).0);
    }

    #[test]
    fn probe_history_accumulates_on_waiting_pairs() {
        let manager = QuarantineManager::new();
        manager.defer("BTC-USDC-PERP", "reduce-only rejection", None, None, None);
        manager.record_probe(
            "BTC-USDC-PERP",
            ProbeRecord {
                venue: "lighter".into(),
                symbol: "BTC-USDC-PERP".into(),
                success: false,
                at: Utc::now(),
            },
        );
        let states = manager.list_states();
        assert_eq!(states["BTC-USDC-PERP"].probe_history.len(), 1);
        assert!(!states["BTC-USDC-PERP"].probe_history[0].success);
    }

    #[test]
    fn reduce_only_guard_flags_legs_once() {
        let guard = ReduceOnlyGuard::new();
        guard.register_event("BTC-USDC-PERP", "lighter", "BTC-USDC-PERP", "code 21740");
        guard.register_event("BTC-USDC-PERP", "lighter", "BTC-USDC-PERP", "code 21740");
        guard.register_event("BTC-USDC-PERP", "backpack", "BTC-USDC-PERP", "code 21740");

        let pairs = guard.list_blocked_pairs();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].legs.len(), 2);
        assert!(guard.is_blocked("btc-usdc-perp"));

        guard.clear("BTC-USDC-PERP");
        assert!(!guard.is_blocked("BTC-USDC-PERP"));
    }

    #[test]
    fn grid_levels_discretize_spread_bands() {
        assert_eq!(grid_level(0.05, 0.1), 1);
        assert_eq!(grid_level(0.1, 0.1), 1);
        assert_eq!(grid_level(0.25, 0.1), 2);
        assert_eq!(grid_level(0.9, 0.1), 9);
        assert_eq!(grid_level(0.5, 0.0), 1);
    }
}
