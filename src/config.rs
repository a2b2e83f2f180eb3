// =============================================================================
// Runtime Configuration — engine settings loaded at startup
// =============================================================================
//
// Every field carries `#[serde(default)]` so that adding new fields never
// breaks loading an older config file. The outer loader (YAML/JSON file,
// environment) lives outside the core; anything that can deserialize into
// `RuntimeConfig` works.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTC-USDC-PERP".to_string(),
        "ETH-USDC-PERP".to_string(),
        "SOL-USDC-PERP".to_string(),
    ]
}

fn default_price_spread_threshold() -> f64 {
    0.005
}

fn default_funding_rate_threshold() -> f64 {
    0.0001
}

fn default_min_score_threshold() -> f64 {
    0.001
}

fn default_update_interval() -> u64 {
    5
}

fn default_data_freshness() -> f64 {
    5.0
}

fn default_data_timeout() -> u64 {
    90
}

fn default_check_interval() -> u64 {
    45
}

fn default_startup_grace() -> u64 {
    120
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_health_log_interval() -> u64 {
    300
}

fn default_balance_cache_ttl() -> u64 {
    30
}

fn default_market_timeout() -> u64 {
    60
}

fn default_limit_timeout() -> u64 {
    60
}

fn default_dual_limit_initial_delay() -> f64 {
    30.0
}

fn default_dual_limit_max_delay() -> f64 {
    600.0
}

fn default_dual_limit_backoff_factor() -> f64 {
    2.0
}

fn default_slippage_open() -> f64 {
    0.0005
}

fn default_slippage_close() -> f64 {
    0.001
}

fn default_stability_window() -> f64 {
    8.0
}

fn default_probe_quantity() -> f64 {
    0.001
}

fn default_trade_quantity() -> f64 {
    0.001
}

fn default_probe_price() -> f64 {
    2000.0
}

// =============================================================================
// Per-venue credentials
// =============================================================================

/// Connection credentials and toggles for one venue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VenueConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    /// Signing key: base64 ED25519 seed (Backpack) or hex secp256k1 key
    /// (GRVT). Unused on API-key-only venues.
    #[serde(default)]
    pub private_key: String,
    /// Trading sub-account id on venues with a two-tier account model.
    #[serde(default)]
    pub sub_account_id: String,
    #[serde(default)]
    pub testnet: bool,
    #[serde(default = "default_true")]
    pub enable_websocket: bool,
}

// =============================================================================
// Risk-gate settings
// =============================================================================

/// Price-stability gate parameters for one symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceStabilityConfig {
    /// Observation window in seconds. `<= 0` disables the gate.
    #[serde(default = "default_stability_window")]
    pub window_seconds: f64,
    /// Max allowed `(max - min) / min * 100` over the window, per side.
    #[serde(default)]
    pub threshold_pct: Option<f64>,
}

impl Default for PriceStabilityConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_stability_window(),
            threshold_pct: Some(0.05),
        }
    }
}

// =============================================================================
// Order-execution settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderExecutionConfig {
    /// Base quantity for one arbitrage leg.
    #[serde(default = "default_trade_quantity")]
    pub trade_quantity: f64,
    /// Fill-wait timeout for batched market orders on the batch venue.
    #[serde(default = "default_market_timeout")]
    pub lighter_market_order_timeout: u64,
    /// Fill-wait timeout for limit orders (dual-limit path).
    #[serde(default = "default_limit_timeout")]
    pub limit_order_timeout: u64,
    /// Dual-limit backoff: first delay after both legs expire unfilled.
    #[serde(default = "default_dual_limit_initial_delay")]
    pub dual_limit_retry_initial_delay: f64,
    /// Dual-limit backoff ceiling.
    #[serde(default = "default_dual_limit_max_delay")]
    pub dual_limit_retry_max_delay: f64,
    /// Dual-limit backoff multiplier per consecutive failure.
    #[serde(default = "default_dual_limit_backoff_factor")]
    pub dual_limit_retry_backoff_factor: f64,
    /// Slippage fraction for opening trades (0.0005 = 5 bp).
    #[serde(default = "default_slippage_open")]
    pub slippage_percent_open: f64,
    /// Slippage fraction for closing trades.
    #[serde(default = "default_slippage_close")]
    pub slippage_percent_close: f64,
    /// Minimum quantity used by the reduce-only probe orders.
    #[serde(default = "default_probe_quantity")]
    pub probe_quantity: f64,
    /// Far-from-market probe price; the goal is immediate rejection or
    /// cancellation, never execution.
    #[serde(default = "default_probe_price")]
    pub probe_price: f64,
}

impl Default for OrderExecutionConfig {
    fn default() -> Self {
        Self {
            trade_quantity: default_trade_quantity(),
            lighter_market_order_timeout: default_market_timeout(),
            limit_order_timeout: default_limit_timeout(),
            dual_limit_retry_initial_delay: default_dual_limit_initial_delay(),
            dual_limit_retry_max_delay: default_dual_limit_max_delay(),
            dual_limit_retry_backoff_factor: default_dual_limit_backoff_factor(),
            slippage_percent_open: default_slippage_open(),
            slippage_percent_close: default_slippage_close(),
            probe_quantity: default_probe_quantity(),
            probe_price: default_probe_price(),
        }
    }
}

// =============================================================================
// Connection-health settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds without a sample after which a (venue, symbol) is stale.
    #[serde(default = "default_data_timeout")]
    pub data_timeout_seconds: u64,
    /// Interval between health sweeps.
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    /// No checks run during the first N seconds after start.
    #[serde(default = "default_startup_grace")]
    pub startup_grace_seconds: u64,
    /// Bounded reconnect attempts per venue; exhaustion leaves the venue
    /// degraded until human intervention.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Interval between per-venue health report log lines.
    #[serde(default = "default_health_log_interval")]
    pub health_check_log_interval: u64,
    /// Standalone-scanner mode: retry forever with exponential backoff
    /// capped at 60 s instead of the bounded attempt budget.
    #[serde(default)]
    pub unbounded_reconnect: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            data_timeout_seconds: default_data_timeout(),
            check_interval_seconds: default_check_interval(),
            startup_grace_seconds: default_startup_grace(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            health_check_log_interval: default_health_log_interval(),
            unbounded_reconnect: false,
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the Helix engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Venue credential blocks, keyed by venue id ("backpack", "grvt",
    /// "lighter").
    #[serde(default)]
    pub venues: HashMap<String, VenueConfig>,

    /// Normalized symbols the engine monitors and trades.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    // --- Opportunity thresholds ---------------------------------------------
    /// Minimum price spread percent to emit an opportunity.
    #[serde(default = "default_price_spread_threshold")]
    pub price_spread_threshold: f64,
    /// Minimum absolute funding-rate difference to emit an opportunity.
    #[serde(default = "default_funding_rate_threshold")]
    pub funding_rate_threshold: f64,
    /// Minimum score for an opportunity to reach the executor.
    #[serde(default = "default_min_score_threshold")]
    pub min_score_threshold: f64,

    // --- Data freshness -----------------------------------------------------
    /// Legacy slow-scan interval (seconds).
    #[serde(default = "default_update_interval")]
    pub update_interval: u64,
    /// Max age (seconds) for a book to count as fresh in risk checks.
    #[serde(default = "default_data_freshness")]
    pub data_freshness_seconds: f64,

    // --- Subsystem blocks ---------------------------------------------------
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub order_execution: OrderExecutionConfig,
    /// Per-symbol price-stability gate settings; missing symbols use the
    /// default block.
    #[serde(default)]
    pub price_stability: HashMap<String, PriceStabilityConfig>,
    /// Balance cache TTL in seconds.
    #[serde(default = "default_balance_cache_ttl")]
    pub balance_cache_ttl: u64,
    /// Timezone offset (hours from UTC) for the wall-clock-aligned probe
    /// scheduler.
    #[serde(default)]
    pub probe_timezone_offset_hours: i32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            venues: HashMap::new(),
            symbols: default_symbols(),
            price_spread_threshold: default_price_spread_threshold(),
            funding_rate_threshold: default_funding_rate_threshold(),
            min_score_threshold: default_min_score_threshold(),
            update_interval: default_update_interval(),
            data_freshness_seconds: default_data_freshness(),
            health: HealthConfig::default(),
            order_execution: OrderExecutionConfig::default(),
            price_stability: HashMap::new(),
            balance_cache_ttl: default_balance_cache_ttl(),
            probe_timezone_offset_hours: 0,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            venues = config.venues.len(),
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Price-stability settings for `symbol`, falling back to the defaults
    /// when the symbol has no dedicated block.
    pub fn price_stability_for(&self, symbol: &str) -> PriceStabilityConfig {
        self.price_stability
            .get(symbol)
            .copied()
            .unwrap_or_default()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbols.len(), 3);
        assert_eq!(cfg.symbols[0], "BTC-USDC-PERP");
        assert!((cfg.price_spread_threshold - 0.005).abs() < f64::EPSILON);
        assert_eq!(cfg.health.data_timeout_seconds, 90);
        assert_eq!(cfg.health.check_interval_seconds, 45);
        assert_eq!(cfg.health.startup_grace_seconds, 120);
        assert_eq!(cfg.health.max_reconnect_attempts, 3);
        assert_eq!(cfg.order_execution.lighter_market_order_timeout, 60);
        assert!((cfg.order_execution.dual_limit_retry_initial_delay - 30.0).abs() < f64::EPSILON);
        assert_eq!(cfg.balance_cache_ttl, 30);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbols, default_symbols());
        assert_eq!(cfg.health.health_check_log_interval, 300);
        assert!((cfg.order_execution.slippage_percent_open - 0.0005).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "symbols": ["ETH-USDC-PERP"],
            "price_spread_threshold": 0.1,
            "venues": { "backpack": { "api_key": "k", "testnet": true } }
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["ETH-USDC-PERP"]);
        assert!((cfg.price_spread_threshold - 0.1).abs() < f64::EPSILON);
        let bp = cfg.venues.get("backpack").unwrap();
        assert_eq!(bp.api_key, "k");
        assert!(bp.testnet);
        assert!(bp.enable_websocket);
        assert_eq!(cfg.health.max_reconnect_attempts, 3);
    }

    #[test]
    fn price_stability_fallback_to_default_block() {
        let mut cfg = RuntimeConfig::default();
        cfg.price_stability.insert(
            "BTC-USDC-PERP".into(),
            PriceStabilityConfig {
                window_seconds: 12.0,
                threshold_pct: Some(0.1),
            },
        );
        let tuned = cfg.price_stability_for("BTC-USDC-PERP");
        assert!((tuned.window_seconds - 12.0).abs() < f64::EPSILON);
        let fallback = cfg.price_stability_for("ETH-USDC-PERP");
        assert!((fallback.window_seconds - default_stability_window()).abs() < f64::EPSILON);
    }
}
